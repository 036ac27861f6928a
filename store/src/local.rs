use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::bson::{self, Document};
use crate::config::StoreConfig;
use crate::storage::{Storage, StorageMessage};
use crate::{document_id, DocumentStore, Filter, TxnOptions};

type Collection = Arc<RwLock<BTreeMap<i64, Document>>>;

/// Tree sled creates for itself, never a collection
const SLED_DEFAULT_TREE: &[u8] = b"__sled__default";

/// Embedded document store.
///
/// Collections live in memory, each behind its own lock, and are created on
/// first use. When opened with a path every write is also queued to a
/// background task that batches it into sled; the contents are loaded back
/// on the next open.
pub struct LocalStore {
    collections: RwLock<HashMap<String, Collection>>,
    storage_tx: Option<mpsc::UnboundedSender<StorageMessage>>,
}

impl LocalStore {
    /// A store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            storage_tx: None,
        }
    }

    /// Open the store, loading and persisting to `path` when given.
    ///
    /// Must be called from within a tokio runtime when `path` is set.
    pub fn open(path: Option<PathBuf>, config: &StoreConfig) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::in_memory());
        };

        let db = sled::open(&path).with_context(|| format!("Failed to open {:?}", path))?;

        let mut collections = HashMap::new();
        let mut loaded_entries = 0;

        for name in db.tree_names() {
            if name.as_ref() == SLED_DEFAULT_TREE {
                continue;
            }
            let collection_name = String::from_utf8(name.to_vec())
                .context("Collection name in storage is not valid UTF-8")?;
            let tree = db.open_tree(&name)?;

            let mut documents = BTreeMap::new();
            for entry in tree.iter() {
                let (key, value) = entry?;
                let id = i64::from_be_bytes(
                    key.as_ref()
                        .try_into()
                        .with_context(|| format!("Malformed key in {}", collection_name))?,
                );
                let document: Document = bson::from_slice(&value)
                    .with_context(|| format!("Malformed document {}/{}", collection_name, id))?;
                documents.insert(id, document);
            }

            info!(
                "Collection '{}' has {} documents",
                collection_name,
                documents.len()
            );
            loaded_entries += documents.len();
            collections.insert(collection_name, Arc::new(RwLock::new(documents)));
        }

        info!(
            "Loaded {} documents into {} collections from storage",
            loaded_entries,
            collections.len()
        );

        let (storage_tx, storage_rx) = mpsc::unbounded_channel();
        let storage = Storage::new(db, storage_rx, config.batch_size, config.batch_timeout());
        tokio::spawn(storage.run());

        Ok(Self {
            collections: RwLock::new(collections),
            storage_tx: Some(storage_tx),
        })
    }

    fn collection(&self, name: &str) -> Collection {
        if let Some(collection) = self.collections.read().get(name) {
            return collection.clone();
        }

        let mut collections = self.collections.write();
        collections
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!("Created collection '{}'", name);
                Arc::new(RwLock::new(BTreeMap::new()))
            })
            .clone()
    }

    fn persist_put(&self, collection: &str, id: i64, document: &Document) -> Result<()> {
        let Some(storage_tx) = &self.storage_tx else {
            return Ok(());
        };
        let bytes = bson::to_vec(document)?;
        storage_tx
            .send(StorageMessage::Put {
                collection: collection.to_string(),
                id,
                bytes,
            })
            .map_err(|_| anyhow!("Storage task has stopped"))
    }

    fn persist_delete(&self, collection: &str, id: i64) -> Result<()> {
        let Some(storage_tx) = &self.storage_tx else {
            return Ok(());
        };
        storage_tx
            .send(StorageMessage::Delete {
                collection: collection.to_string(),
                id,
            })
            .map_err(|_| anyhow!("Storage task has stopped"))
    }

    /// Wait until every queued write has reached disk
    pub async fn sync(&self) -> Result<()> {
        let Some(storage_tx) = &self.storage_tx else {
            return Ok(());
        };
        let (reply_tx, reply_rx) = oneshot::channel();
        storage_tx
            .send(StorageMessage::Flush { reply_tx })
            .map_err(|_| anyhow!("Storage task has stopped"))?;
        reply_rx.await?;
        Ok(())
    }

    /// Number of documents in a collection
    pub fn len(&self, collection: &str) -> usize {
        self.collection(collection).read().len()
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl DocumentStore for LocalStore {
    async fn insert(&self, collection: &str, document: Document) -> Result<()> {
        let Some(id) = document_id(&document) else {
            bail!("Document has no integer _id");
        };

        let table = self.collection(collection);
        let mut table = table.write();
        if table.contains_key(&id) {
            bail!("E11000 duplicate key error: {}/{}", collection, id);
        }
        self.persist_put(collection, id, &document)?;
        table.insert(id, document);
        Ok(())
    }

    async fn delete_one(&self, collection: &str, id: i64) -> Result<u64> {
        let table = self.collection(collection);
        let mut table = table.write();
        if table.remove(&id).is_none() {
            return Ok(0);
        }
        self.persist_delete(collection, id)?;
        Ok(1)
    }

    async fn find_one(&self, collection: &str, id: i64) -> Result<Option<Document>> {
        let table = self.collection(collection);
        let table = table.read();
        Ok(table.get(&id).cloned())
    }

    async fn replace_one(&self, collection: &str, id: i64, document: Document) -> Result<u64> {
        let table = self.collection(collection);
        let mut table = table.write();
        let Some(current) = table.get_mut(&id) else {
            return Ok(0);
        };
        if *current == document {
            return Ok(0);
        }
        self.persist_put(collection, id, &document)?;
        *current = document;
        Ok(1)
    }

    async fn update_many(&self, collection: &str, filter: &Filter, set: Document) -> Result<u64> {
        let table = self.collection(collection);
        let mut table = table.write();

        let mut modified = 0;
        for (id, document) in table.iter_mut() {
            if !filter.matches(document) {
                continue;
            }
            let changed = set.iter().any(|(k, v)| document.get(k) != Some(v));
            if !changed {
                continue;
            }
            for (k, v) in set.iter() {
                document.insert(k.clone(), v.clone());
            }
            self.persist_put(collection, *id, document)?;
            modified += 1;
        }

        Ok(modified)
    }

    /// The collection stays write-locked while `mutation` runs, so
    /// transactions on the same collection are serialized and every write is
    /// visible as soon as the lock is released.
    async fn with_transaction(
        &self,
        collection: &str,
        id: i64,
        _options: &TxnOptions,
        mutation: &mut (dyn FnMut(Document) -> Result<Option<Document>> + Send),
    ) -> Result<bool> {
        let table = self.collection(collection);
        let mut table = table.write();

        let Some(current) = table.get(&id) else {
            return Ok(false);
        };

        if let Some(replacement) = mutation(current.clone())? {
            self.persist_put(collection, id, &replacement)?;
            table.insert(id, replacement);
        }

        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.sync().await
    }
}
