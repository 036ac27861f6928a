use histogram::AtomicHistogram;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Constants for metrics
const DEFAULT_HISTOGRAM_PRECISION: u8 = 7;
const DEFAULT_HISTOGRAM_MAX_VALUE_BITS: u8 = 34; // 2^34 us ~= 4.8 hours

/// Ceiling for a single store operation
pub const OPERATION_CEILING_MS: u64 = 2000;

/// Ceiling for the unlock-all sweep
pub const CLEAR_LOCK_CEILING_MS: u64 = 10_000;

/// Histogram and counter names shared by the drivers
pub mod tags {
    pub const REPORT_QUOTA_USAGE: &str = "REPORT_QUOTA_USAGE";
    pub const KV_PUT: &str = "KV_PUT";
    pub const KV_GET: &str = "KV_GET";
    pub const ADD_CREDIT: &str = "ADD_CREDIT";
    pub const ADD_DOC: &str = "ADD_DOC";
    pub const DELETE_DOC: &str = "DELETE_DOC";
    pub const CLEAR_LOCK: &str = "CLEAR_LOCK";
    pub const QUERY_USER: &str = "QUERY_USER";

    pub const ADD_DOC_ERROR: &str = "ADD_DOC_ERROR";
    pub const DELETE_DOC_ERROR: &str = "DELETE_DOC_ERROR";

    /// Counter incremented when the operation behind `tag` fails
    pub fn error(tag: &str) -> String {
        format!("{}_ERROR", tag)
    }
}

/// A histogram for tracking latencies, kept in microseconds
struct LatencyHistogram {
    description: String,
    ceiling: Duration,
    hist: AtomicHistogram,
}

impl LatencyHistogram {
    fn new(description: &str, ceiling_ms: u64) -> Result<Self, histogram::Error> {
        Ok(Self {
            description: description.to_string(),
            ceiling: Duration::from_millis(ceiling_ms),
            hist: AtomicHistogram::new(
                DEFAULT_HISTOGRAM_PRECISION,
                DEFAULT_HISTOGRAM_MAX_VALUE_BITS,
            )?,
        })
    }

    /// Record a latency value, clamped to the ceiling
    fn record(&self, latency: Duration) {
        let micros = latency.min(self.ceiling).as_micros() as u64;
        if let Err(e) = self.hist.increment(micros) {
            warn!("Failed to record latency {}: {}", micros, e);
        }
    }

    /// Get the percentile in milliseconds
    fn percentile_ms(&self, p: f64) -> f64 {
        match self.hist.load().percentile(p) {
            Ok(Some(bucket)) => {
                let mid = (bucket.start() + bucket.end()) / 2;
                Duration::from_micros(mid).as_secs_f64() * 1000.0
            }
            _ => 0.0,
        }
    }

    /// Upper edge of the highest non-empty bucket in milliseconds
    fn max_ms(&self) -> f64 {
        self.hist
            .load()
            .into_iter()
            .filter(|b| b.count() > 0)
            .last()
            .map(|b| Duration::from_micros(b.end()).as_secs_f64() * 1000.0)
            .unwrap_or(0.0)
    }

    /// Get the count of recorded values
    fn count(&self) -> u64 {
        self.hist.load().into_iter().map(|b| b.count()).sum()
    }
}

/// Named latency histograms and counters for one driver invocation.
///
/// Built once in `main` and shared by `Arc`; every method takes `&self`.
/// Reads of unknown names yield zeros.
#[derive(Default)]
pub struct LatencyRegistry {
    histograms: RwLock<BTreeMap<String, Arc<LatencyHistogram>>>,
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
}

impl LatencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn histogram(&self, tag: &str, description: &str, ceiling_ms: u64) -> Option<Arc<LatencyHistogram>> {
        if let Some(hist) = self.histograms.read().get(tag) {
            return Some(hist.clone());
        }

        let mut histograms = self.histograms.write();
        if let Some(hist) = histograms.get(tag) {
            return Some(hist.clone());
        }
        match LatencyHistogram::new(description, ceiling_ms) {
            Ok(hist) => {
                let hist = Arc::new(hist);
                histograms.insert(tag.to_string(), hist.clone());
                Some(hist)
            }
            Err(e) => {
                warn!("Failed to create histogram {}: {}", tag, e);
                None
            }
        }
    }

    fn counter(&self, tag: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.read().get(tag) {
            return counter.clone();
        }
        self.counters
            .write()
            .entry(tag.to_string())
            .or_default()
            .clone()
    }

    /// Record the time elapsed since `start` into the histogram `tag`
    pub fn report_latency(&self, tag: &str, start: Instant, description: &str, ceiling_ms: u64) {
        self.record(tag, start.elapsed(), description, ceiling_ms);
    }

    /// Record an already measured latency into the histogram `tag`
    pub fn record(&self, tag: &str, latency: Duration, description: &str, ceiling_ms: u64) {
        if let Some(hist) = self.histogram(tag, description, ceiling_ms) {
            hist.record(latency);
        }
    }

    pub fn inc_counter(&self, tag: &str) {
        self.counter(tag).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_counter(&self, tag: &str) -> u64 {
        self.counters
            .read()
            .get(tag)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of samples recorded under `tag`
    pub fn count(&self, tag: &str) -> u64 {
        self.histograms
            .read()
            .get(tag)
            .map(|h| h.count())
            .unwrap_or(0)
    }

    /// Append `p50:p95:p99:` in milliseconds for `tag` to `sink`
    pub fn proc_percentiles(&self, tag: &str, sink: &mut String) {
        let (p50, p95, p99) = match self.histograms.read().get(tag) {
            Some(hist) => (
                hist.percentile_ms(50.0),
                hist.percentile_ms(95.0),
                hist.percentile_ms(99.0),
            ),
            None => (0.0, 0.0, 0.0),
        };
        sink.push_str(&format!("{:.3}:{:.3}:{:.3}:", p50, p95, p99));
    }
}

impl fmt::Display for LatencyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Latency (ms):")?;
        for (tag, hist) in self.histograms.read().iter() {
            writeln!(
                f,
                "{} ({}): count={}, p50={:.3}, p95={:.3}, p99={:.3}, max={:.3}",
                tag,
                hist.description,
                hist.count(),
                hist.percentile_ms(50.0),
                hist.percentile_ms(95.0),
                hist.percentile_ms(99.0),
                hist.max_ms(),
            )?;
        }

        writeln!(f, "Counters:")?;
        for (tag, counter) in self.counters.read().iter() {
            writeln!(f, "{}={}", tag, counter.load(Ordering::Relaxed))?;
        }
        Ok(())
    }
}
