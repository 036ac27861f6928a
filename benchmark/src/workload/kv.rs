use anyhow::Result;
use common::{now_ms, UserId};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;
use tracing::{error, info};

use crate::dispatcher::{Dispatcher, RunSummary};
use crate::ops::{ChargingOps, Delta, LockOutcome, UpdateOutcome};
use crate::payload::{generate_payload, new_loyalty_number};
use crate::state::{KvAction, UserKvState};
use crate::workload::{BenchmarkParams, Workload};

/// Percentage of updates that only touch the loyalty card number
pub const DELTA_PROPORTION: u32 = 50;

/// Length of the hex blob in a fully rewritten payload
pub const JSON_SIZE: usize = 120;

pub enum KvResult {
    Lock(Result<LockOutcome>),
    Update(Result<UpdateOutcome>),
}

pub struct KvOutcome {
    user: usize,
    result: KvResult,
}

/// Lock a user, then rewrite their payload and release the lock, over and over
pub struct KvWorkload {
    ops: Arc<ChargingOps>,
    users: Vec<UserKvState>,
    delta_proportion: u32,
    json_size: usize,
    watched_user: Option<UserId>,

    in_flight_skips: u64,
    lock_attempts: u64,
    contested_skips: u64,
    full_updates: u64,
    delta_updates: u64,
}

impl KvWorkload {
    pub fn new(ops: Arc<ChargingOps>, user_count: usize) -> Self {
        Self {
            ops,
            users: (0..user_count)
                .map(|i| UserKvState::new(UserId::from(i)))
                .collect(),
            delta_proportion: DELTA_PROPORTION,
            json_size: JSON_SIZE,
            watched_user: None,
            in_flight_skips: 0,
            lock_attempts: 0,
            contested_skips: 0,
            full_updates: 0,
            delta_updates: 0,
        }
    }

    pub fn with_delta_proportion(mut self, delta_proportion: u32) -> Self {
        self.delta_proportion = delta_proportion;
        self
    }

    pub fn users(&self) -> &[UserKvState] {
        &self.users
    }

    pub fn lock_attempts(&self) -> u64 {
        self.lock_attempts
    }

    pub fn updates(&self) -> u64 {
        self.full_updates + self.delta_updates
    }

    pub fn lock_failures(&self) -> u64 {
        self.users
            .iter()
            .map(UserKvState::locked_by_someone_else_count)
            .sum()
    }

    fn next_delta(&mut self, rng: &mut StdRng) -> Result<Delta> {
        if self.delta_proportion > rng.random_range(0..=100) {
            self.delta_updates += 1;
            Ok(Delta::NewLoyaltyNumber(new_loyalty_number(rng)))
        } else {
            self.full_updates += 1;
            Ok(Delta::Full(generate_payload(self.json_size, rng)?))
        }
    }
}

impl Workload for KvWorkload {
    type Outcome = KvOutcome;

    fn user_count(&self) -> usize {
        self.users.len()
    }

    fn next_operation(
        &mut self,
        user: usize,
        rng: &mut StdRng,
    ) -> Option<BoxFuture<'static, KvOutcome>> {
        let user_id = self.users[user].id;
        self.watched_user.get_or_insert(user_id);

        match self.users[user].next_action(now_ms()) {
            KvAction::SkipInFlight => {
                self.in_flight_skips += 1;
                None
            }
            KvAction::SkipContested => {
                self.contested_skips += 1;
                None
            }
            KvAction::Lock => {
                self.lock_attempts += 1;
                let ops = self.ops.clone();
                Some(
                    async move {
                        KvOutcome {
                            user,
                            result: KvResult::Lock(ops.get_and_lock_user(user_id).await),
                        }
                    }
                    .boxed(),
                )
            }
            KvAction::Update => {
                let delta = match self.next_delta(rng) {
                    Ok(delta) => delta,
                    Err(e) => {
                        error!("Unable to build payload for user {}: {:#}", user_id, e);
                        self.users[user].released();
                        return None;
                    }
                };

                let lock_id = self.users[user].lock_id();
                let ops = self.ops.clone();
                Some(
                    async move {
                        KvOutcome {
                            user,
                            result: KvResult::Update(
                                ops.update_locked_user(user_id, lock_id, &delta).await,
                            ),
                        }
                    }
                    .boxed(),
                )
            }
        }
    }

    fn on_complete(&mut self, outcome: KvOutcome) {
        let state = &mut self.users[outcome.user];
        match outcome.result {
            KvResult::Lock(Ok(LockOutcome::Acquired(lock_id))) => state.lock_acquired(lock_id),
            KvResult::Lock(Ok(LockOutcome::HeldBySomeoneElse { expiry_ms, .. })) => {
                state.lock_held_elsewhere(expiry_ms.unwrap_or_else(now_ms))
            }
            KvResult::Update(Ok(UpdateOutcome::LostLock { .. })) => state.lost_lock(),
            KvResult::Lock(Ok(LockOutcome::UserNotFound))
            | KvResult::Update(Ok(UpdateOutcome::UserNotFound)) => {
                error!("User {} not found", state.id);
                state.released();
            }
            // Failures were logged and counted by the ops layer
            KvResult::Lock(Err(_)) | KvResult::Update(Err(_)) | KvResult::Update(Ok(_)) => {
                state.released()
            }
        }
    }

    fn periodic_query(&mut self) -> Option<BoxFuture<'static, ()>> {
        let user_id = self.watched_user?;
        let ops = self.ops.clone();
        Some(
            async move {
                let _ = ops.query_user(user_id).await;
            }
            .boxed(),
        )
    }

    fn report(&self, _summary: &RunSummary) {
        info!("{} events skipped because transaction was in flight", self.in_flight_skips);
        info!("{} lock attempts", self.lock_attempts);
        info!("{} contested lock attempts", self.contested_skips);
        info!("{} lock failures", self.lock_failures());
        info!("{} full updates", self.full_updates);
        info!("{} delta updates", self.delta_updates);
    }
}

/// Release stale locks, then run the KV workload for the configured duration
pub async fn run(ops: Arc<ChargingOps>, params: BenchmarkParams) -> Result<RunSummary> {
    ops.unlock_all().await?;

    let mut workload = KvWorkload::new(ops.clone(), params.user_count);
    let summary = Dispatcher::new(params).run(&mut workload).await;

    workload.report(&summary);
    summary.report(ops.registry());
    Ok(summary)
}
