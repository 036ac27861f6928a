pub mod delete;
pub mod kv;
pub mod load;
pub mod transactional;

pub use kv::KvWorkload;
pub use transactional::TxnWorkload;

use futures::future::BoxFuture;
use rand::rngs::StdRng;

use crate::dispatcher::RunSummary;

/// Knobs shared by the timed workloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BenchmarkParams {
    pub user_count: usize,
    pub tp_ms: u64,
    pub duration_seconds: u64,
    /// Zero disables the periodic query
    pub query_freq_seconds: u64,
    pub extra_ms: u64,
}

/// A workload the dispatcher drives one tick at a time.
///
/// `next_operation` runs on the dispatcher's task and must mark the user busy
/// before handing back a future; `on_complete` is called with that future's
/// outcome once the dispatcher has awaited it.
pub trait Workload {
    type Outcome: Send + 'static;

    fn user_count(&self) -> usize;

    fn next_operation(
        &mut self,
        user: usize,
        rng: &mut StdRng,
    ) -> Option<BoxFuture<'static, Self::Outcome>>;

    fn on_complete(&mut self, outcome: Self::Outcome);

    /// Read-only look at a well-known user, awaited inline by the dispatcher
    fn periodic_query(&mut self) -> Option<BoxFuture<'static, ()>>;

    /// Log the workload's own counters at the end of a run
    fn report(&self, summary: &RunSummary);
}
