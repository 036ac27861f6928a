use anyhow::{ensure, Result};
use common::{now_ms, SessionId, UserId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

use crate::document::UserDocument;
use crate::metrics::tags;
use crate::ops::ChargingOps;
use crate::pacer::Pacer;
use crate::payload::generate_payload;

/// Length of the hex blob every loaded user carries
pub const LOAD_JSON_SIZE: usize = 120;

const PROGRESS_INTERVAL: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadParams {
    pub user_count: usize,
    pub tp_ms: u64,
    pub max_initial_credit: i64,
    pub extra_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSummary {
    pub issued: usize,
    pub elapsed: Duration,
    pub users_per_ms: f64,
    pub halted: bool,
}

/// A freshly provisioned user as the load writes it: created with some
/// starting credit, topped up by 100 and holding one 10 unit reservation.
pub fn build_user(
    user_id: UserId,
    json: String,
    initial_credit: i64,
    now_ms: i64,
) -> UserDocument {
    let mut user = UserDocument::new_user(user_id, json, initial_credit, now_ms);
    user.add_credit(100, "Txn1", now_ms);
    user.report_quota_usage(100, 10, SessionId(100), "TX2", now_ms);
    user
}

/// Insert users `0..user_count` at the paced rate.
///
/// Every user shares one payload. Each insert is awaited before the next is
/// issued and the load stops at the first one that fails.
pub async fn run(ops: Arc<ChargingOps>, params: LoadParams) -> Result<LoadSummary> {
    ensure!(
        params.max_initial_credit > 0,
        "maxInitialCredit must be positive"
    );

    let mut rng = StdRng::from_os_rng();
    let json = generate_payload(LOAD_JSON_SIZE, &mut rng)?;

    let mut pacer = Pacer::new(params.tp_ms, params.extra_ms);
    let mut issued = 0;
    let mut halted = false;
    let start = Instant::now();

    for i in 0..params.user_count {
        pacer.admit().await;

        let user = build_user(
            UserId::from(i),
            json.clone(),
            rng.random_range(0..params.max_initial_credit),
            now_ms(),
        );
        let inserted = ops.insert_user(&user).await;
        issued += 1;

        if inserted.is_err() || ops.registry().get_counter(tags::ADD_DOC_ERROR) > 0 {
            error!("Error adding documents, halting load");
            halted = true;
            break;
        }

        if i % PROGRESS_INTERVAL == 1 {
            info!("Upserted {} users...", i);
            let _ = ops.query_user(UserId::from(i)).await;
        }
    }

    let elapsed = start.elapsed();
    let elapsed_ms = elapsed.as_millis();
    let users_per_ms = if elapsed_ms > 0 {
        issued as f64 / elapsed_ms as f64
    } else {
        0.0
    };
    info!("Upserted {:.3} users per ms...", users_per_ms);
    info!("{}", ops.registry());

    Ok(LoadSummary {
        issued,
        elapsed,
        users_per_ms,
        halted,
    })
}
