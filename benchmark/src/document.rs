use common::{SessionId, UserId};
use rand::Rng;
use std::collections::BTreeMap;
use std::fmt;

/// How long a soft lock stays valid after it is taken
pub const LOCK_TIMEOUT_MS: i64 = 50;

/// Recent transactions older than this are dropped on every mutation
pub const FIVE_MINUTES_IN_MS: i64 = 300_000;

const ADDED_BY_TXN: &str = " added by Txn ";
const ALREADY_HAPPENED: &str = " already happened";

/// Outcome of [`UserDocument::report_quota_usage`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuotaStatus {
    Ok = 42,
    NoMoney = 46,
    SomeUnitsAllocated = 47,
    AllUnitsAllocated = 48,
    TxnAlreadyHappened = 53,
}

impl QuotaStatus {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QuotaStatus::Ok => "OK",
            QuotaStatus::NoMoney => "NO_MONEY",
            QuotaStatus::SomeUnitsAllocated => "SOME_UNITS_ALLOCATED",
            QuotaStatus::AllUnitsAllocated => "ALL_UNITS_ALLOCATED",
            QuotaStatus::TxnAlreadyHappened => "TXN_ALREADY_HAPPENED",
        };
        write!(f, "{}", name)
    }
}

/// A credit movement, doubling as the idempotency marker for its txn id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentTransaction {
    pub user_id: UserId,
    pub user_txn_id: String,
    pub txn_time_ms: i64,
    pub session_id: SessionId,
    pub approved_amount: i64,
    pub spent_amount: i64,
    pub purpose: String,
}

/// Credit set aside for one downstream session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageReservation {
    pub user_id: UserId,
    pub allocated_amount: i64,
    pub session_id: SessionId,
    pub last_date_ms: i64,
}

/// One subscriber as persisted in the users collection.
///
/// Every time-dependent method takes the current wall-clock time in epoch
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDocument {
    pub user_id: UserId,
    pub json_object: String,
    pub last_seen_ms: Option<i64>,
    pub soft_lock_session_id: SessionId,
    pub soft_lock_expiry_ms: Option<i64>,
    pub balance: i64,
    pub recent_transactions: BTreeMap<String, RecentTransaction>,
    pub usage: BTreeMap<SessionId, UsageReservation>,
}

impl UserDocument {
    /// An unlocked user with no history and a zero balance
    pub fn empty(user_id: UserId) -> Self {
        Self {
            user_id,
            json_object: String::new(),
            last_seen_ms: None,
            soft_lock_session_id: SessionId::NO_SESSION,
            soft_lock_expiry_ms: None,
            balance: 0,
            recent_transactions: BTreeMap::new(),
            usage: BTreeMap::new(),
        }
    }

    /// A freshly provisioned user whose initial credit is recorded by a
    /// `Create_<id>` transaction
    pub fn new_user(user_id: UserId, json_object: String, initial_credit: i64, created_ms: i64) -> Self {
        let mut user = Self {
            json_object,
            last_seen_ms: Some(created_ms),
            ..Self::empty(user_id)
        };

        user.record_transaction(RecentTransaction {
            user_id,
            user_txn_id: format!("Create_{}", user_id),
            txn_time_ms: created_ms,
            session_id: SessionId::NO_SESSION,
            approved_amount: 0,
            spent_amount: initial_credit,
            purpose: "Created".to_string(),
        });

        user
    }

    fn has_txn(&self, txn_id: &str) -> bool {
        self.recent_transactions.contains_key(txn_id)
    }

    fn record_transaction(&mut self, txn: RecentTransaction) {
        self.balance += txn.spent_amount;
        self.recent_transactions.insert(txn.user_txn_id.clone(), txn);
    }

    /// Drop recent transactions older than five minutes, returning how many went
    pub fn delete_old_transactions(&mut self, now_ms: i64) -> usize {
        let threshold = now_ms - FIVE_MINUTES_IN_MS;
        let before = self.recent_transactions.len();
        self.recent_transactions
            .retain(|_, txn| txn.txn_time_ms >= threshold);
        before - self.recent_transactions.len()
    }

    /// Credit the user once per `txn_id`
    pub fn add_credit(&mut self, extra_credit: i64, txn_id: &str, now_ms: i64) -> String {
        let message = if self.has_txn(txn_id) {
            format!("Txn {}{}", txn_id, ALREADY_HAPPENED)
        } else {
            self.record_transaction(RecentTransaction {
                user_id: self.user_id,
                user_txn_id: txn_id.to_string(),
                txn_time_ms: now_ms,
                session_id: SessionId::NO_SESSION,
                approved_amount: 0,
                spent_amount: extra_credit,
                purpose: "Add Credit".to_string(),
            });
            format!("{}{}{}", extra_credit, ADDED_BY_TXN, txn_id)
        };

        self.delete_old_transactions(now_ms);
        message
    }

    /// Debit `units_used` and replace the session's reservation with up to
    /// `units_wanted` units.
    ///
    /// The credit available for the new reservation is judged before the
    /// session's previous reservation is released.
    pub fn report_quota_usage(
        &mut self,
        units_used: i64,
        units_wanted: i64,
        session_id: SessionId,
        txn_id: &str,
        now_ms: i64,
    ) -> QuotaStatus {
        if self.has_txn(txn_id) {
            self.delete_old_transactions(now_ms);
            return QuotaStatus::TxnAlreadyHappened;
        }

        let amount_spent = -units_used;
        let available_credit = self.available_credit() - units_used;
        self.usage.remove(&session_id);

        let (status, approved, decision) = if units_wanted == 0 {
            (
                QuotaStatus::Ok,
                0,
                format!("Recorded usage of {}", amount_spent),
            )
        } else if available_credit <= 0 {
            (
                QuotaStatus::NoMoney,
                0,
                format!("Negative balance: {}", available_credit),
            )
        } else if units_wanted > available_credit {
            (
                QuotaStatus::SomeUnitsAllocated,
                available_credit,
                format!(
                    "Allocated {} units of {} asked for",
                    available_credit, units_wanted
                ),
            )
        } else {
            (
                QuotaStatus::AllUnitsAllocated,
                units_wanted,
                format!("Allocated {}", units_wanted),
            )
        };

        if approved > 0 {
            self.usage.insert(
                session_id,
                UsageReservation {
                    user_id: self.user_id,
                    allocated_amount: approved,
                    session_id,
                    last_date_ms: now_ms,
                },
            );
        }

        self.record_transaction(RecentTransaction {
            user_id: self.user_id,
            user_txn_id: txn_id.to_string(),
            txn_time_ms: now_ms,
            session_id,
            approved_amount: approved,
            spent_amount: amount_spent,
            purpose: decision,
        });

        self.delete_old_transactions(now_ms);
        status
    }

    /// Take the soft lock when nobody holds a live one.
    ///
    /// Returns the new lock id, or [`SessionId::NO_SESSION`] when the current
    /// holder's lock has not yet gone stale.
    pub fn lock<R: Rng + ?Sized>(&mut self, now_ms: i64, rng: &mut R) -> SessionId {
        let stale = match self.soft_lock_expiry_ms {
            None => true,
            Some(expiry) => expiry < now_ms - LOCK_TIMEOUT_MS,
        };

        if !stale {
            return SessionId::NO_SESSION;
        }

        self.soft_lock_session_id = SessionId::random(rng);
        self.soft_lock_expiry_ms = Some(now_ms + LOCK_TIMEOUT_MS);
        self.soft_lock_session_id
    }

    pub fn unlock(&mut self) {
        self.soft_lock_session_id = SessionId::NO_SESSION;
        self.soft_lock_expiry_ms = None;
    }

    pub fn is_locked_by_someone_else(&self, my_lock_id: SessionId) -> bool {
        !self.soft_lock_session_id.is_none() && self.soft_lock_session_id != my_lock_id
    }

    /// Whether a soft lock is held and has not gone stale
    pub fn has_active_lock(&self, now_ms: i64) -> bool {
        !self.soft_lock_session_id.is_none()
            && self
                .soft_lock_expiry_ms
                .is_some_and(|expiry| expiry > now_ms - LOCK_TIMEOUT_MS)
    }

    pub fn reserved_credit(&self) -> i64 {
        self.usage.values().map(|u| u.allocated_amount).sum()
    }

    pub fn available_credit(&self) -> i64 {
        self.balance - self.reserved_credit()
    }

    /// Units currently reserved by `session_id`
    pub fn reservation(&self, session_id: SessionId) -> Option<i64> {
        self.usage.get(&session_id).map(|u| u.allocated_amount)
    }
}

impl fmt::Display for UserDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "User {{userId={}, balance={}, reserved={}, softLockSessionId={}, softLockExpiry={:?}, lastSeen={:?}, recentTransactions={}, usage={}, json={}}}",
            self.user_id,
            self.balance,
            self.reserved_credit(),
            self.soft_lock_session_id,
            self.soft_lock_expiry_ms,
            self.last_seen_ms,
            self.recent_transactions.len(),
            self.usage.len(),
            self.json_object,
        )
    }
}
