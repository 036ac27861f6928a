use std::time::{Duration, Instant};

/// Admits at most `target_per_ms` issuance attempts per millisecond.
///
/// Milliseconds are counted on a monotonic clock from the pacer's creation.
/// Once a millisecond's budget is spent, [`Pacer::admit`] yields to other
/// tasks until the next millisecond starts and then sleeps `extra_ms` more
/// when that is non-zero.
pub struct Pacer {
    target_per_ms: u64,
    extra: Duration,
    origin: Instant,
    current_ms: u128,
    ops_this_ms: u64,
}

impl Pacer {
    pub fn new(target_per_ms: u64, extra_ms: u64) -> Self {
        Self {
            target_per_ms: target_per_ms.max(1),
            extra: Duration::from_millis(extra_ms),
            origin: Instant::now(),
            current_ms: 0,
            ops_this_ms: 0,
        }
    }

    fn elapsed_ms(&self) -> u128 {
        self.origin.elapsed().as_millis()
    }

    /// Wait until one more attempt fits in the budget, then count it
    pub async fn admit(&mut self) {
        let now = self.elapsed_ms();
        if now != self.current_ms {
            self.current_ms = now;
            self.ops_this_ms = 0;
        }

        if self.ops_this_ms >= self.target_per_ms {
            while self.elapsed_ms() == self.current_ms {
                tokio::task::yield_now().await;
            }

            if !self.extra.is_zero() {
                tokio::time::sleep(self.extra).await;
            }

            self.current_ms = self.elapsed_ms();
            self.ops_this_ms = 0;
        }

        self.ops_this_ms += 1;
    }
}
