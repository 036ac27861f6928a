use anyhow::Result;
use common::{now_ms, UserId};
use futures::future::BoxFuture;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tracing::{error, info};

use crate::dispatcher::{Dispatcher, RunSummary};
use crate::ops::{ChargingOps, CreditOutcome, QuotaOutcome};
use crate::state::{TxnAction, UserTxnState};
use crate::workload::{BenchmarkParams, Workload};

/// User the periodic query looks at when the population is big enough
pub const GENERIC_QUERY_USER_ID: i64 = 42;

pub enum TxnResult {
    Credit(Result<Option<CreditOutcome>>),
    Usage(Result<Option<QuotaOutcome>>),
}

pub struct TxnOutcome {
    user: usize,
    result: TxnResult,
}

/// Spend down reservations and top users up when they run low
pub struct TxnWorkload {
    ops: Arc<ChargingOps>,
    users: Vec<UserTxnState>,
    watched_user: UserId,
    pid: u32,

    add_credit_calls: u64,
    report_usage_calls: u64,
    in_flight_skips: u64,
}

impl TxnWorkload {
    pub fn new(ops: Arc<ChargingOps>, user_count: usize, rng: &mut StdRng) -> Self {
        let watched_user = if user_count as i64 > GENERIC_QUERY_USER_ID {
            UserId(GENERIC_QUERY_USER_ID)
        } else {
            UserId(0)
        };

        Self {
            ops,
            users: (0..user_count)
                .map(|i| UserTxnState::new(UserId::from(i), rng))
                .collect(),
            watched_user,
            pid: std::process::id(),
            add_credit_calls: 0,
            report_usage_calls: 0,
            in_flight_skips: 0,
        }
    }

    pub fn users(&self) -> &[UserTxnState] {
        &self.users
    }

    pub fn add_credit_calls(&self) -> u64 {
        self.add_credit_calls
    }

    pub fn report_usage_calls(&self) -> u64 {
        self.report_usage_calls
    }
}

impl Workload for TxnWorkload {
    type Outcome = TxnOutcome;

    fn user_count(&self) -> usize {
        self.users.len()
    }

    fn next_operation(
        &mut self,
        user: usize,
        rng: &mut StdRng,
    ) -> Option<BoxFuture<'static, TxnOutcome>> {
        let Some(action) = self.users[user].next_action(rng) else {
            self.in_flight_skips += 1;
            return None;
        };

        let user_id = self.users[user].id;
        let session_id = self.users[user].session_id;
        let ops = self.ops.clone();

        match action {
            TxnAction::AddCredit { amount } => {
                self.add_credit_calls += 1;
                Some(
                    async move {
                        TxnOutcome {
                            user,
                            result: TxnResult::Credit(ops.add_credit(user_id, amount).await),
                        }
                    }
                    .boxed(),
                )
            }
            TxnAction::ReportUsage {
                units_used,
                units_wanted,
            } => {
                self.report_usage_calls += 1;
                let txn_id = format!(
                    "ReportQuotaUsage_{}_{}_{}",
                    self.pid,
                    self.report_usage_calls,
                    now_ms()
                );
                Some(
                    async move {
                        let result = ops
                            .report_quota_usage(user_id, units_used, units_wanted, session_id, &txn_id)
                            .await;
                        TxnOutcome {
                            user,
                            result: TxnResult::Usage(result),
                        }
                    }
                    .boxed(),
                )
            }
        }
    }

    fn on_complete(&mut self, outcome: TxnOutcome) {
        let state = &mut self.users[outcome.user];
        match outcome.result {
            TxnResult::Credit(Ok(Some(credit))) => {
                state.spendable_balance = credit.available_credit;
            }
            TxnResult::Usage(Ok(Some(quota))) => {
                state.adopt(quota.available_credit, quota.reservation);
            }
            TxnResult::Credit(Ok(None)) | TxnResult::Usage(Ok(None)) => {
                error!("User {} not found", state.id);
            }
            // Failures were logged and counted by the ops layer
            TxnResult::Credit(Err(_)) | TxnResult::Usage(Err(_)) => {}
        }
        state.end_tran();
    }

    fn periodic_query(&mut self) -> Option<BoxFuture<'static, ()>> {
        let ops = self.ops.clone();
        let user_id = self.watched_user;
        Some(
            async move {
                let _ = ops.query_user(user_id).await;
            }
            .boxed(),
        )
    }

    fn report(&self, _summary: &RunSummary) {
        info!("{} Add Credit calls", self.add_credit_calls);
        info!("{} Report Usage calls", self.report_usage_calls);
        info!(
            "{} Skipped because transaction was in flight",
            self.in_flight_skips
        );
    }
}

/// Drop leftover reservations, then run the charging workload for the
/// configured duration
pub async fn run(ops: Arc<ChargingOps>, params: BenchmarkParams) -> Result<RunSummary> {
    ops.clear_unfinished_transactions().await?;

    let mut dispatcher = Dispatcher::new(params);
    let mut rng = StdRng::from_os_rng();
    let mut workload = TxnWorkload::new(ops.clone(), params.user_count, &mut rng);
    let summary = dispatcher.run(&mut workload).await;

    workload.report(&summary);
    summary.report(ops.registry());
    Ok(summary)
}
