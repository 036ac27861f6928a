use anyhow::Result;
use common::UserId;
use std::sync::Arc;
use tracing::info;

use crate::metrics::tags;
use crate::ops::ChargingOps;
use crate::pacer::Pacer;

/// Delete users `0..user_count` one at a time at the paced rate, returning
/// how many went
pub async fn run(
    ops: Arc<ChargingOps>,
    user_count: usize,
    tp_ms: u64,
    extra_ms: u64,
) -> Result<u64> {
    let before = ops.registry().get_counter(tags::DELETE_DOC);
    let mut pacer = Pacer::new(tp_ms, extra_ms);

    for i in 0..user_count {
        pacer.admit().await;
        // Failures are counted and logged by the op
        let _ = ops.delete_user(UserId::from(i)).await;
    }

    let deleted = ops.registry().get_counter(tags::DELETE_DOC) - before;
    info!("Deleted {} users...", deleted);
    info!("{}", ops.registry());
    Ok(deleted)
}
