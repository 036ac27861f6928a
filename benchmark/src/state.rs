use common::{SessionId, UserId};
use rand::Rng;

use crate::document::LOCK_TIMEOUT_MS;

/// Below this the transactional workload tops the user up
pub const MIN_SPENDABLE_BALANCE: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvStatus {
    Unlocked,
    TryingToLock,
    Locked,
    LockedBySomeoneElse,
    Updating,
}

/// What the KV workload should do with a user picked this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvAction {
    Lock,
    Update,
    SkipInFlight,
    SkipContested,
}

/// Client-side view of one user in the KV workload
#[derive(Debug, Clone)]
pub struct UserKvState {
    pub id: UserId,
    tx_in_flight: bool,
    status: KvStatus,
    lock_id: SessionId,
    other_lock_expiry_ms: i64,
    locked_by_someone_else_count: u64,
}

impl UserKvState {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            tx_in_flight: false,
            status: KvStatus::Unlocked,
            lock_id: SessionId::NO_SESSION,
            other_lock_expiry_ms: 0,
            locked_by_someone_else_count: 0,
        }
    }

    pub fn status(&self) -> KvStatus {
        self.status
    }

    pub fn lock_id(&self) -> SessionId {
        self.lock_id
    }

    pub fn is_tx_in_flight(&self) -> bool {
        self.tx_in_flight
    }

    pub fn locked_by_someone_else_count(&self) -> u64 {
        self.locked_by_someone_else_count
    }

    pub fn start_tran(&mut self) {
        self.tx_in_flight = true;
    }

    pub fn end_tran(&mut self) {
        self.tx_in_flight = false;
    }

    /// Decide the next step for this user, starting a transaction when the
    /// answer involves the store
    pub fn next_action(&mut self, now_ms: i64) -> KvAction {
        if self.tx_in_flight {
            return KvAction::SkipInFlight;
        }

        match self.status {
            KvStatus::LockedBySomeoneElse
                if self.other_lock_expiry_ms + LOCK_TIMEOUT_MS >= now_ms =>
            {
                KvAction::SkipContested
            }
            KvStatus::LockedBySomeoneElse | KvStatus::Unlocked => {
                self.start_tran();
                self.status = KvStatus::TryingToLock;
                KvAction::Lock
            }
            KvStatus::Locked => {
                self.start_tran();
                self.status = KvStatus::Updating;
                KvAction::Update
            }
            // Only reachable while a transaction is in flight
            KvStatus::TryingToLock | KvStatus::Updating => KvAction::SkipInFlight,
        }
    }

    pub fn lock_acquired(&mut self, lock_id: SessionId) {
        self.status = KvStatus::Locked;
        self.lock_id = lock_id;
        self.end_tran();
    }

    /// Someone else holds a live lock expiring at `expiry_ms`; back off until
    /// it goes stale
    pub fn lock_held_elsewhere(&mut self, expiry_ms: i64) {
        self.status = KvStatus::LockedBySomeoneElse;
        self.other_lock_expiry_ms = expiry_ms;
        self.locked_by_someone_else_count += 1;
        self.end_tran();
    }

    /// The update went through, or the user was missing or the store failed
    pub fn released(&mut self) {
        self.status = KvStatus::Unlocked;
        self.lock_id = SessionId::NO_SESSION;
        self.end_tran();
    }

    /// Our lock was taken over before the update landed
    pub fn lost_lock(&mut self) {
        self.locked_by_someone_else_count += 1;
        self.released();
    }
}

/// Store call the transactional workload issues for a user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnAction {
    AddCredit {
        amount: i64,
    },
    ReportUsage {
        units_used: i64,
        units_wanted: i64,
    },
}

/// Client-side view of one user in the transactional workload
#[derive(Debug, Clone)]
pub struct UserTxnState {
    pub id: UserId,
    pub spendable_balance: i64,
    pub currently_reserved: i64,
    pub session_id: SessionId,
    tx_in_flight: bool,
}

impl UserTxnState {
    /// Until the store says otherwise the user is assumed to be able to spend
    pub fn new<R: Rng + ?Sized>(id: UserId, rng: &mut R) -> Self {
        Self {
            id,
            spendable_balance: MIN_SPENDABLE_BALANCE,
            currently_reserved: 0,
            session_id: SessionId::random(rng),
            tx_in_flight: false,
        }
    }

    pub fn is_tx_in_flight(&self) -> bool {
        self.tx_in_flight
    }

    pub fn end_tran(&mut self) {
        self.tx_in_flight = false;
    }

    /// Pick the next call for this user, or `None` while one is in flight
    pub fn next_action<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<TxnAction> {
        if self.tx_in_flight {
            return None;
        }
        self.tx_in_flight = true;

        if self.spendable_balance < MIN_SPENDABLE_BALANCE {
            Some(TxnAction::AddCredit {
                amount: rng.random_range(1000..2000),
            })
        } else {
            Some(TxnAction::ReportUsage {
                units_used: self.currently_reserved * 9 / 10,
                units_wanted: rng.random_range(0..100),
            })
        }
    }

    /// Take on what the store reported after a call
    pub fn adopt(&mut self, available_credit: i64, reservation: Option<i64>) {
        self.spendable_balance = available_credit;
        self.currently_reserved = reservation.unwrap_or(0);
    }
}
