use anyhow::Result;
use common::{now_ms, SessionId, UserId};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use store::bson::{Bson, Document};
use store::{DocumentStore, Filter, TxnOptions};
use tracing::{error, info};

use crate::codec::{decode_user, encode_user, field, opt_datetime};
use crate::document::{QuotaStatus, UserDocument};
use crate::metrics::{tags, LatencyRegistry, CLEAR_LOCK_CEILING_MS, OPERATION_CEILING_MS};
use crate::payload::with_loyalty_number;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired(SessionId),
    HeldBySomeoneElse {
        holder: SessionId,
        expiry_ms: Option<i64>,
    },
    UserNotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    LostLock { holder: SessionId },
    UserNotFound,
}

/// New payload for a locked user
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    /// Replace the whole JSON payload
    Full(String),
    /// Rewrite only the loyalty card number inside the stored payload
    NewLoyaltyNumber(i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditOutcome {
    pub message: String,
    pub available_credit: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaOutcome {
    pub status: QuotaStatus,
    pub available_credit: i64,
    pub reservation: Option<i64>,
}

/// The charging operations, each run as one store transaction and timed
/// into its own histogram.
///
/// Every call counts `<TAG>` on success and `<TAG>_ERROR` on failure; store
/// errors are logged here and handed back for the caller to branch on.
pub struct ChargingOps {
    store: Arc<dyn DocumentStore>,
    registry: Arc<LatencyRegistry>,
    collection: String,
    options: TxnOptions,
}

impl ChargingOps {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        registry: Arc<LatencyRegistry>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            collection: collection.into(),
            options: TxnOptions::majority(),
        }
    }

    /// Commit every charging transaction with `options` instead of majority
    pub fn with_txn_options(mut self, options: TxnOptions) -> Self {
        self.options = options;
        self
    }

    pub fn txn_options(&self) -> &TxnOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<LatencyRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    async fn timed<T, F>(&self, tag: &str, description: &str, ceiling_ms: u64, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = op.await;
        self.registry
            .report_latency(tag, start, description, ceiling_ms);

        match &result {
            Ok(_) => self.registry.inc_counter(tag),
            Err(e) => {
                error!("{} failed: {:#}", tag, e);
                self.registry.inc_counter(&tags::error(tag));
            }
        }
        result
    }

    /// Take the user's soft lock, writing back only the two lock fields
    pub async fn get_and_lock_user(&self, user_id: UserId) -> Result<LockOutcome> {
        self.timed(tags::KV_GET, "KV Get time", OPERATION_CEILING_MS, async {
            let mut outcome = LockOutcome::UserNotFound;
            self.store
                .with_transaction(
                    &self.collection,
                    user_id.0,
                    &self.options,
                    &mut |mut doc: Document| -> Result<Option<Document>> {
                        let mut user = decode_user(&doc)?;
                        let lock_id = user.lock(now_ms(), &mut rand::rng());

                        if lock_id.is_none() {
                            outcome = LockOutcome::HeldBySomeoneElse {
                                holder: user.soft_lock_session_id,
                                expiry_ms: user.soft_lock_expiry_ms,
                            };
                            return Ok(None);
                        }

                        doc.insert(field::SOFT_LOCK_SESSION_ID, lock_id.0);
                        doc.insert(field::SOFT_LOCK_EXPIRY, opt_datetime(user.soft_lock_expiry_ms));
                        outcome = LockOutcome::Acquired(lock_id);
                        Ok(Some(doc))
                    },
                )
                .await?;
            Ok(outcome)
        })
        .await
    }

    /// Store a new payload for a user we hold the lock on and release the lock
    pub async fn update_locked_user(
        &self,
        user_id: UserId,
        lock_id: SessionId,
        delta: &Delta,
    ) -> Result<UpdateOutcome> {
        self.timed(tags::KV_PUT, "KV Put Time", OPERATION_CEILING_MS, async {
            let mut outcome = UpdateOutcome::UserNotFound;
            self.store
                .with_transaction(
                    &self.collection,
                    user_id.0,
                    &self.options,
                    &mut |mut doc: Document| -> Result<Option<Document>> {
                        let mut user = decode_user(&doc)?;

                        if user.is_locked_by_someone_else(lock_id) {
                            outcome = UpdateOutcome::LostLock {
                                holder: user.soft_lock_session_id,
                            };
                            return Ok(None);
                        }

                        let json = match delta {
                            Delta::Full(json) => json.clone(),
                            Delta::NewLoyaltyNumber(number) => {
                                with_loyalty_number(&user.json_object, *number)?
                            }
                        };
                        user.unlock();

                        doc.insert(field::SOFT_LOCK_SESSION_ID, user.soft_lock_session_id.0);
                        doc.insert(field::SOFT_LOCK_EXPIRY, Bson::Null);
                        doc.insert(field::JSON_OBJECT, json);
                        outcome = UpdateOutcome::Updated;
                        Ok(Some(doc))
                    },
                )
                .await?;
            Ok(outcome)
        })
        .await
    }

    /// Credit the user under a fresh `AddCredit_<amount>_<ms>` transaction id
    pub async fn add_credit(&self, user_id: UserId, extra_credit: i64) -> Result<Option<CreditOutcome>> {
        self.timed(tags::ADD_CREDIT, "Add Credit", OPERATION_CEILING_MS, async {
            let txn_id = format!("AddCredit_{}_{}", extra_credit, now_ms());
            let mut outcome = None;
            self.store
                .with_transaction(
                    &self.collection,
                    user_id.0,
                    &self.options,
                    &mut |doc: Document| -> Result<Option<Document>> {
                        let mut user = decode_user(&doc)?;
                        let message = user.add_credit(extra_credit, &txn_id, now_ms());
                        outcome = Some(CreditOutcome {
                            message,
                            available_credit: user.available_credit(),
                        });
                        Ok(Some(encode_user(&user)))
                    },
                )
                .await?;
            Ok(outcome)
        })
        .await
    }

    pub async fn report_quota_usage(
        &self,
        user_id: UserId,
        units_used: i64,
        units_wanted: i64,
        session_id: SessionId,
        txn_id: &str,
    ) -> Result<Option<QuotaOutcome>> {
        self.timed(
            tags::REPORT_QUOTA_USAGE,
            "Report Quota Usage",
            OPERATION_CEILING_MS,
            async {
                let mut outcome = None;
                self.store
                    .with_transaction(
                        &self.collection,
                        user_id.0,
                        &self.options,
                        &mut |doc: Document| -> Result<Option<Document>> {
                            let mut user = decode_user(&doc)?;
                            let status = user.report_quota_usage(
                                units_used,
                                units_wanted,
                                session_id,
                                txn_id,
                                now_ms(),
                            );
                            outcome = Some(QuotaOutcome {
                                status,
                                available_credit: user.available_credit(),
                                reservation: user.reservation(session_id),
                            });
                            Ok(Some(encode_user(&user)))
                        },
                    )
                    .await?;
                Ok(outcome)
            },
        )
        .await
    }

    /// Read-only look at one user, logged for a human to eyeball
    pub async fn query_user(&self, user_id: UserId) -> Result<Option<UserDocument>> {
        self.timed(tags::QUERY_USER, "Query User", OPERATION_CEILING_MS, async {
            info!("Query user #{}...", user_id);
            let Some(doc) = self.store.find_one(&self.collection, user_id.0).await? else {
                info!("Document is null...");
                return Ok(None);
            };

            let user = decode_user(&doc)?;
            info!("{}", user);
            info!(
                "Show amount of credit currently reserved for products... {}",
                user.reserved_credit()
            );
            Ok(Some(user))
        })
        .await
    }

    pub async fn insert_user(&self, user: &UserDocument) -> Result<()> {
        self.timed(tags::ADD_DOC, "Add time", OPERATION_CEILING_MS, async {
            self.store
                .insert(&self.collection, encode_user(user))
                .await
        })
        .await
    }

    /// Delete one user; a missing user counts as a failure
    pub async fn delete_user(&self, user_id: UserId) -> Result<()> {
        self.timed(tags::DELETE_DOC, "Delete time", OPERATION_CEILING_MS, async {
            let deleted = self.store.delete_one(&self.collection, user_id.0).await?;
            anyhow::ensure!(deleted == 1, "User {} not found", user_id);
            Ok(())
        })
        .await
    }

    /// Release every soft lock left behind by earlier runs
    pub async fn unlock_all(&self) -> Result<u64> {
        info!("Clearing locked sessions from prior runs...");
        let unlocked = self
            .timed(tags::CLEAR_LOCK, "Clear Locks", CLEAR_LOCK_CEILING_MS, async {
                let mut set = Document::new();
                set.insert(field::SOFT_LOCK_SESSION_ID, SessionId::NO_SESSION.0);
                set.insert(field::SOFT_LOCK_EXPIRY, Bson::Null);

                let filter = Filter::ne(field::SOFT_LOCK_SESSION_ID, SessionId::NO_SESSION.0);
                self.store
                    .update_many(&self.collection, &filter, set)
                    .await
            })
            .await?;
        info!("Unlocked {} records", unlocked);
        info!("...done");
        Ok(unlocked)
    }

    /// Drop reservations left behind by earlier runs
    pub async fn clear_unfinished_transactions(&self) -> Result<u64> {
        info!("Clearing unfinished transactions from prior runs...");
        let mut set = Document::new();
        set.insert(field::USAGE, Document::new());
        let cleared = self
            .store
            .update_many(&self.collection, &Filter::All, set)
            .await?;
        info!("Cleared reservations on {} users", cleared);
        info!("...done");
        Ok(cleared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{ExtraUserData, LOYALTY_SCHEME_NAME};
    use store::LocalStore;

    const USERS: &str = "users";

    fn ops() -> ChargingOps {
        ChargingOps::new(
            Arc::new(LocalStore::in_memory()),
            Arc::new(LatencyRegistry::new()),
            USERS,
        )
    }

    async fn seed(ops: &ChargingOps, id: i64, credit: i64) {
        let payload = ExtraUserData {
            mysterious_hex_payload: "00ff".to_string(),
            loyalty_scheme_name: LOYALTY_SCHEME_NAME.to_string(),
            loyalty_scheme_number: 1,
        };
        let user = UserDocument::new_user(UserId(id), payload.to_json().unwrap(), credit, now_ms());
        ops.insert_user(&user).await.unwrap();
    }

    async fn load(ops: &ChargingOps, id: i64) -> UserDocument {
        let doc = ops.store().find_one(USERS, id).await.unwrap().unwrap();
        decode_user(&doc).unwrap()
    }

    #[tokio::test]
    async fn test_lock_update_cycle() {
        let ops = ops();
        seed(&ops, 1, 100).await;

        let LockOutcome::Acquired(lock_id) = ops.get_and_lock_user(UserId(1)).await.unwrap() else {
            panic!("lock not acquired");
        };
        assert_eq!(load(&ops, 1).await.soft_lock_session_id, lock_id);

        match ops.get_and_lock_user(UserId(1)).await.unwrap() {
            LockOutcome::HeldBySomeoneElse { holder, .. } => assert_eq!(holder, lock_id),
            other => panic!("unexpected {:?}", other),
        }

        let outcome = ops
            .update_locked_user(UserId(1), lock_id, &Delta::NewLoyaltyNumber(777))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::Updated);

        let user = load(&ops, 1).await;
        assert!(user.soft_lock_session_id.is_none());
        assert!(user.soft_lock_expiry_ms.is_none());
        let payload: ExtraUserData = serde_json::from_str(&user.json_object).unwrap();
        assert_eq!(payload.loyalty_scheme_number, 777);
        assert_eq!(payload.mysterious_hex_payload, "00ff");

        assert_eq!(ops.registry().get_counter(tags::KV_GET), 2);
        assert_eq!(ops.registry().get_counter(tags::KV_PUT), 1);
        assert_eq!(ops.registry().count(tags::KV_GET), 2);
    }

    #[tokio::test]
    async fn test_update_with_lost_lock() {
        let ops = ops();
        seed(&ops, 1, 100).await;

        let LockOutcome::Acquired(lock_id) = ops.get_and_lock_user(UserId(1)).await.unwrap() else {
            panic!("lock not acquired");
        };

        let other = SessionId(lock_id.0.wrapping_add(1));
        let outcome = ops
            .update_locked_user(UserId(1), other, &Delta::Full("{}".to_string()))
            .await
            .unwrap();
        assert_eq!(outcome, UpdateOutcome::LostLock { holder: lock_id });
        assert_eq!(load(&ops, 1).await.soft_lock_session_id, lock_id);
    }

    #[tokio::test]
    async fn test_missing_user() {
        let ops = ops();
        assert_eq!(
            ops.get_and_lock_user(UserId(9)).await.unwrap(),
            LockOutcome::UserNotFound
        );
        assert!(ops.add_credit(UserId(9), 10).await.unwrap().is_none());
        assert!(ops.query_user(UserId(9)).await.unwrap().is_none());

        assert!(ops.delete_user(UserId(9)).await.is_err());
        assert_eq!(ops.registry().get_counter(tags::DELETE_DOC_ERROR), 1);
    }

    #[tokio::test]
    async fn test_credit_and_quota() {
        let ops = ops();
        seed(&ops, 1, 100).await;

        let credit = ops.add_credit(UserId(1), 50).await.unwrap().unwrap();
        assert!(credit.message.starts_with("50 added by Txn AddCredit_50_"));
        assert_eq!(credit.available_credit, 150);

        let quota = ops
            .report_quota_usage(UserId(1), 0, 200, SessionId(3), "Q1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(quota.status, QuotaStatus::SomeUnitsAllocated);
        assert_eq!(quota.reservation, Some(150));
        assert_eq!(quota.available_credit, 0);

        let again = ops
            .report_quota_usage(UserId(1), 0, 200, SessionId(3), "Q1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.status, QuotaStatus::TxnAlreadyHappened);

        let user = load(&ops, 1).await;
        assert_eq!(user.balance, 150);
        assert_eq!(user.reservation(SessionId(3)), Some(150));
        assert_eq!(ops.registry().get_counter(tags::REPORT_QUOTA_USAGE), 2);
    }

    #[tokio::test]
    async fn test_duplicate_insert_counts_error() {
        let ops = ops();
        seed(&ops, 1, 100).await;

        let user = UserDocument::new_user(UserId(1), "{}".to_string(), 0, now_ms());
        assert!(ops.insert_user(&user).await.is_err());
        assert_eq!(ops.registry().get_counter(tags::ADD_DOC), 1);
        assert_eq!(ops.registry().get_counter(tags::ADD_DOC_ERROR), 1);
    }

    #[tokio::test]
    async fn test_unlock_all_and_clear_reservations() {
        let ops = ops();
        for id in 0..3 {
            seed(&ops, id, 100).await;
        }
        ops.get_and_lock_user(UserId(0)).await.unwrap();
        ops.get_and_lock_user(UserId(2)).await.unwrap();
        ops.report_quota_usage(UserId(1), 0, 10, SessionId(8), "R")
            .await
            .unwrap();

        assert_eq!(ops.unlock_all().await.unwrap(), 2);
        assert_eq!(ops.registry().count(tags::CLEAR_LOCK), 1);
        for id in 0..3 {
            let user = load(&ops, id).await;
            assert!(user.soft_lock_session_id.is_none());
            assert!(user.soft_lock_expiry_ms.is_none());
        }

        ops.clear_unfinished_transactions().await.unwrap();
        assert!(load(&ops, 1).await.usage.is_empty());
    }

    /// Remembers the durability of every transaction it runs
    struct RecordingStore {
        inner: LocalStore,
        seen: parking_lot::Mutex<Vec<store::Durability>>,
    }

    #[async_trait::async_trait]
    impl DocumentStore for RecordingStore {
        async fn insert(&self, collection: &str, document: Document) -> Result<()> {
            self.inner.insert(collection, document).await
        }

        async fn delete_one(&self, collection: &str, id: i64) -> Result<u64> {
            self.inner.delete_one(collection, id).await
        }

        async fn find_one(&self, collection: &str, id: i64) -> Result<Option<Document>> {
            self.inner.find_one(collection, id).await
        }

        async fn replace_one(&self, collection: &str, id: i64, document: Document) -> Result<u64> {
            self.inner.replace_one(collection, id, document).await
        }

        async fn update_many(&self, collection: &str, filter: &Filter, set: Document) -> Result<u64> {
            self.inner.update_many(collection, filter, set).await
        }

        async fn with_transaction(
            &self,
            collection: &str,
            id: i64,
            options: &TxnOptions,
            mutation: &mut (dyn FnMut(Document) -> Result<Option<Document>> + Send),
        ) -> Result<bool> {
            self.seen.lock().push(options.durability);
            self.inner
                .with_transaction(collection, id, options, mutation)
                .await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    #[tokio::test]
    async fn test_configured_durability_reaches_store() {
        let recorder = Arc::new(RecordingStore {
            inner: LocalStore::in_memory(),
            seen: parking_lot::Mutex::new(Vec::new()),
        });
        let config = store::config::StoreConfig::builder()
            .durability(store::Durability::Acknowledged)
            .build();
        let acknowledged =
            ChargingOps::new(recorder.clone(), Arc::new(LatencyRegistry::new()), USERS)
                .with_txn_options(config.txn_options());
        assert_eq!(
            acknowledged.txn_options().durability,
            store::Durability::Acknowledged
        );

        seed(&acknowledged, 1, 100).await;
        acknowledged.get_and_lock_user(UserId(1)).await.unwrap();
        acknowledged.add_credit(UserId(1), 5).await.unwrap();

        let seen = recorder.seen.lock().clone();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|d| *d == store::Durability::Acknowledged));

        // Without a setting every transaction waits for a majority
        assert_eq!(ops().txn_options().durability, store::Durability::Majority);
    }
}
