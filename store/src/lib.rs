//! Document store interface consumed by the charging workloads.
//!
//! Two implementations are provided: [`MongoStore`] talks to a MongoDB
//! deployment (multi-statement transactions, majority write concern unless
//! configured otherwise) and [`LocalStore`] is an embedded store kept in
//! memory and optionally persisted to disk, used for local runs and tests.

pub mod config;
mod local;
mod mongo;
mod storage;

pub use local::LocalStore;
pub use mongo::MongoStore;
pub use mongodb::bson;

use anyhow::Result;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use config::{Backend, StoreConfig};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Durability a transaction waits for before it is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// A single node has applied the write
    Acknowledged,
    /// A majority of the replica set has applied the write
    #[default]
    Majority,
}

/// Options applied to every transaction started through
/// [`DocumentStore::with_transaction`]
#[derive(Debug, Clone, Copy, Default)]
pub struct TxnOptions {
    pub durability: Durability,
}

impl TxnOptions {
    pub fn majority() -> Self {
        Self {
            durability: Durability::Majority,
        }
    }
}

/// Selects the documents touched by [`DocumentStore::update_many`]
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// Every document in the collection
    All,
    /// Documents whose `field` differs from `value` (a missing field differs)
    Ne { field: String, value: Bson },
}

impl Filter {
    pub fn ne(field: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::Ne {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Evaluate the filter against a document
    pub fn matches(&self, document: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Ne { field, value } => document.get(field) != Some(value),
        }
    }

    /// Render the filter as a MongoDB query document
    pub fn to_document(&self) -> Document {
        match self {
            Filter::All => Document::new(),
            Filter::Ne { field, value } => {
                let mut query = Document::new();
                query.insert(field.clone(), doc! { "$ne": value.clone() });
                query
            }
        }
    }
}

/// Primary-key filter shared by the implementations
pub(crate) fn id_filter(id: i64) -> Document {
    doc! { "_id": id }
}

/// Read `_id` as an integer key
pub(crate) fn document_id(document: &Document) -> Option<i64> {
    match document.get("_id") {
        Some(Bson::Int64(id)) => Some(*id),
        Some(Bson::Int32(id)) => Some(i64::from(*id)),
        _ => None,
    }
}

/// The operations the workloads need from a document store.
///
/// Documents are addressed by their integer `_id`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document; fails when the `_id` already exists
    async fn insert(&self, collection: &str, document: Document) -> Result<()>;

    /// Delete by id, returning how many documents were removed
    async fn delete_one(&self, collection: &str, id: i64) -> Result<u64>;

    /// Fetch by id
    async fn find_one(&self, collection: &str, id: i64) -> Result<Option<Document>>;

    /// Replace by id, returning how many documents were modified
    async fn replace_one(&self, collection: &str, id: i64, document: Document) -> Result<u64>;

    /// Set the fields of `set` on every document matching `filter`,
    /// returning how many documents were modified
    async fn update_many(&self, collection: &str, filter: &Filter, set: Document)
        -> Result<u64>;

    /// Run a read-modify-write of one document inside a transaction.
    ///
    /// `mutation` receives the current document and returns its replacement,
    /// or `None` to leave it as it is. An error from `mutation` aborts the
    /// transaction and is returned. The mutation may be invoked again when
    /// the store retries a transient transaction failure. Returns `false`
    /// when no document with `id` exists, in which case `mutation` is not
    /// called.
    async fn with_transaction(
        &self,
        collection: &str,
        id: i64,
        options: &TxnOptions,
        mutation: &mut (dyn FnMut(Document) -> Result<Option<Document>> + Send),
    ) -> Result<bool>;

    /// Flush and release the underlying resources
    async fn close(&self) -> Result<()>;
}

/// Open the store selected by the configuration's host string
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn DocumentStore>> {
    match config.backend() {
        Backend::Mongo { uri } => {
            info!("Connecting to {}", uri);
            Ok(Arc::new(MongoStore::connect(&uri, config).await?))
        }
        Backend::Local { path } => {
            match &path {
                Some(path) => info!("Opening embedded store at {:?}", path),
                None => info!("Opening in-memory embedded store"),
            }
            Ok(Arc::new(LocalStore::open(path, config)?))
        }
    }
}
