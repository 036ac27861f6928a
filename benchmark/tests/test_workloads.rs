#[cfg(test)]
mod tests {
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::runtime::Runtime;

    use benchmark::codec::decode_user;
    use benchmark::metrics::{tags, LatencyRegistry};
    use benchmark::ops::ChargingOps;
    use benchmark::workload::{delete, kv, load, transactional, BenchmarkParams};
    use common::SessionId;
    use store::bson::Document;
    use store::config::StoreConfig;
    use store::{DocumentStore, Filter, LocalStore, TxnOptions};

    const USERS: usize = 10;

    /// In-memory store whose transactions take `txn_delay` and which counts
    /// lookups of users that are not there
    struct SlowStore {
        inner: LocalStore,
        txn_delay: Duration,
        transactions: AtomicU64,
        missed_finds: AtomicU64,
    }

    impl SlowStore {
        fn new(txn_delay: Duration) -> Self {
            Self {
                inner: LocalStore::in_memory(),
                txn_delay,
                transactions: AtomicU64::new(0),
                missed_finds: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl DocumentStore for SlowStore {
        async fn insert(&self, collection: &str, document: Document) -> Result<()> {
            self.inner.insert(collection, document).await
        }

        async fn delete_one(&self, collection: &str, id: i64) -> Result<u64> {
            self.inner.delete_one(collection, id).await
        }

        async fn find_one(&self, collection: &str, id: i64) -> Result<Option<Document>> {
            let found = self.inner.find_one(collection, id).await?;
            if found.is_none() {
                self.missed_finds.fetch_add(1, Ordering::Relaxed);
            }
            Ok(found)
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
            tokio::time::sleep(self.txn_delay).await;
            self.transactions.fetch_add(1, Ordering::Relaxed);
            self.inner
                .with_transaction(collection, id, options, mutation)
                .await
        }

        async fn close(&self) -> Result<()> {
            self.inner.close().await
        }
    }

    fn ops_for(store: Arc<dyn DocumentStore>, config: &StoreConfig) -> Arc<ChargingOps> {
        Arc::new(ChargingOps::new(
            store,
            Arc::new(LatencyRegistry::new()),
            config.collection.clone(),
        ))
    }

    fn load_params(tp_ms: u64) -> load::LoadParams {
        load::LoadParams {
            user_count: USERS,
            tp_ms,
            max_initial_credit: 1000,
            extra_ms: 0,
        }
    }

    fn run_params(duration_seconds: u64) -> BenchmarkParams {
        BenchmarkParams {
            user_count: USERS,
            tp_ms: 1,
            duration_seconds,
            query_freq_seconds: 1,
            extra_ms: 0,
        }
    }

    async fn assert_all_unlocked(store: &Arc<dyn DocumentStore>, config: &StoreConfig) {
        for id in 0..USERS as i64 {
            let doc = store
                .find_one(&config.collection, id)
                .await
                .unwrap()
                .unwrap();
            let user = decode_user(&doc).unwrap();
            assert!(user.soft_lock_session_id.is_none());
            assert!(user.soft_lock_expiry_ms.is_none());
        }
    }

    #[test]
    fn test_load_then_kv() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = StoreConfig::default();
            config.override_hosts("local").unwrap();
            let store = store::connect(&config).await.unwrap();
            let ops = ops_for(store.clone(), &config);

            let loaded = load::run(ops.clone(), load_params(5)).await.unwrap();
            assert_eq!(loaded.issued, USERS);
            assert_eq!(ops.registry().get_counter(tags::ADD_DOC_ERROR), 0);

            let summary = kv::run(ops.clone(), run_params(3)).await.unwrap();
            assert!(summary.meets_target());
            assert!(ops.registry().get_counter(tags::KV_GET) > 0);
            assert!(ops.registry().get_counter(tags::KV_PUT) > 0);
            assert!(ops.registry().get_counter(tags::QUERY_USER) > 0);
            assert_eq!(ops.registry().get_counter(&tags::error(tags::KV_GET)), 0);
            assert_eq!(ops.registry().get_counter(&tags::error(tags::KV_PUT)), 0);

            // Locks left over from the run are cleared by the next one
            ops.unlock_all().await.unwrap();
            assert_all_unlocked(&store, &config).await;

            store.close().await.unwrap();
        });
    }

    #[test]
    fn test_load_then_transactions() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut config = StoreConfig::default();
            config.override_hosts("local").unwrap();
            let store = store::connect(&config).await.unwrap();
            let ops = ops_for(store.clone(), &config);

            load::run(ops.clone(), load_params(5)).await.unwrap();
            let summary = transactional::run(ops.clone(), run_params(2)).await.unwrap();

            assert!(summary.ticks > 0);
            assert!(ops.registry().get_counter(tags::REPORT_QUOTA_USAGE) > 0);
            assert_eq!(
                ops.registry()
                    .get_counter(&tags::error(tags::REPORT_QUOTA_USAGE)),
                0
            );

            // The load's reservation under session 100 was cleared up front
            for id in 0..USERS as i64 {
                let doc = store
                    .find_one(&config.collection, id)
                    .await
                    .unwrap()
                    .unwrap();
                let user = decode_user(&doc).unwrap();
                assert!(user.reservation(SessionId(100)).is_none());
                assert!(user.available_credit() <= user.balance);
            }

            store.close().await.unwrap();
        });
    }

    #[test]
    fn test_persisted_store_survives_restart() {
        let dir = tempdir().unwrap();
        let mut config = StoreConfig::builder().batch_size(4).build();
        config
            .override_hosts(&format!("local:{}", dir.path().display()))
            .unwrap();

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = store::connect(&config).await.unwrap();
            let ops = ops_for(store.clone(), &config);
            load::run(ops.clone(), load_params(10)).await.unwrap();

            // Leave a lock behind so the next process has something to clear
            ops.get_and_lock_user(common::UserId(3)).await.unwrap();
            store.close().await.unwrap();
        });
        drop(rt);

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = store::connect(&config).await.unwrap();
            let ops = ops_for(store.clone(), &config);

            assert_eq!(ops.unlock_all().await.unwrap(), 1);
            assert_all_unlocked(&store, &config).await;

            assert_eq!(
                delete::run(ops.clone(), USERS, 10, 0).await.unwrap(),
                USERS as u64
            );
            store.close().await.unwrap();
        });
        drop(rt);

        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = store::connect(&config).await.unwrap();
            for id in 0..USERS as i64 {
                assert!(store
                    .find_one(&config.collection, id)
                    .await
                    .unwrap()
                    .is_none());
            }
        });
    }

    #[test]
    fn test_slow_store_misses_target() {
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let store = Arc::new(SlowStore::new(Duration::from_millis(200)));
            let ops = ops_for(store.clone(), &StoreConfig::default());

            load::run(ops.clone(), load_params(5)).await.unwrap();
            // The progress query runs after the queried user's insert landed
            assert_eq!(ops.registry().get_counter(tags::QUERY_USER), 1);
            assert_eq!(store.missed_finds.load(Ordering::Relaxed), 0);

            let summary = kv::run(ops.clone(), run_params(2)).await.unwrap();
            assert!(!summary.meets_target());

            // Each tick waited for its store call
            let transactions = store.transactions.load(Ordering::Relaxed);
            assert!(transactions > 0);
            assert_eq!(summary.ticks, transactions);
            assert!(summary.tps < 10.0);
        });
    }
}
