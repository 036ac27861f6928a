use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};
use tracing::info;

use crate::metrics::{tags, LatencyRegistry};
use crate::pacer::Pacer;
use crate::workload::{BenchmarkParams, Workload};

const PROGRESS_INTERVAL: u64 = 100_000;

/// Share of the requested rate a run must reach to count as a pass
const TARGET_TOLERANCE: f64 = 0.9;

/// What a timed run achieved
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunSummary {
    pub ticks: u64,
    pub elapsed: Duration,
    pub tps: f64,
    pub target_per_ms: u64,
}

impl RunSummary {
    pub fn new(ticks: u64, elapsed: Duration, target_per_ms: u64) -> Self {
        let secs = elapsed.as_secs_f64();
        let tps = if secs > 0.0 { ticks as f64 / secs } else { 0.0 };
        Self {
            ticks,
            elapsed,
            tps,
            target_per_ms,
        }
    }

    pub fn target_tps(&self) -> f64 {
        self.target_per_ms as f64 * 1000.0
    }

    pub fn meets_target(&self) -> bool {
        self.tps >= TARGET_TOLERANCE * self.target_tps()
    }

    /// `GREPABLE SUMMARY:<tpMs>:<tps>:` followed by p50, p95 and p99 of
    /// quota reports, KV puts and KV gets, each field closed by a colon
    pub fn grepable_line(&self, registry: &LatencyRegistry) -> String {
        let mut line = format!("GREPABLE SUMMARY:{}:{:.0}:", self.target_per_ms, self.tps);
        registry.proc_percentiles(tags::REPORT_QUOTA_USAGE, &mut line);
        registry.proc_percentiles(tags::KV_PUT, &mut line);
        registry.proc_percentiles(tags::KV_GET, &mut line);
        line
    }

    /// Log the one-line summary scripts grep for, then the full latency report
    pub fn report(&self, registry: &LatencyRegistry) {
        info!("{}", self.grepable_line(registry));
        info!("{}", registry);
    }
}

/// Issues a workload's operations at a paced rate for a fixed duration.
///
/// One operation runs at a time: the loop waits for each store call before
/// it picks the next user, so a slow store lowers the achieved rate.
pub struct Dispatcher {
    params: BenchmarkParams,
    rng: StdRng,
}

impl Dispatcher {
    pub fn new(params: BenchmarkParams) -> Self {
        Self {
            params,
            rng: StdRng::from_os_rng(),
        }
    }

    pub fn with_seed(params: BenchmarkParams, seed: u64) -> Self {
        Self {
            params,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub async fn run<W: Workload>(&mut self, workload: &mut W) -> RunSummary {
        let duration = Duration::from_secs(self.params.duration_seconds);
        let query_freq = Duration::from_secs(self.params.query_freq_seconds);
        let user_count = workload.user_count();

        let mut pacer = Pacer::new(self.params.tp_ms, self.params.extra_ms);
        let mut ticks = 0u64;

        let start = Instant::now();
        let mut last_query = start;

        while start.elapsed() < duration {
            pacer.admit().await;

            if user_count > 0 {
                let user = self.rng.random_range(0..user_count);
                if let Some(op) = workload.next_operation(user, &mut self.rng) {
                    let outcome = op.await;
                    workload.on_complete(outcome);
                }
            }

            ticks += 1;
            if ticks % PROGRESS_INTERVAL == 1 {
                info!("Transaction {}", ticks);
            }

            if !query_freq.is_zero() && last_query.elapsed() >= query_freq {
                if let Some(query) = workload.periodic_query() {
                    query.await;
                }
                last_query = Instant::now();
            }
        }

        let elapsed = start.elapsed();
        info!("{} transactions done...", ticks);

        RunSummary::new(ticks, elapsed, self.params.tp_ms)
    }
}
