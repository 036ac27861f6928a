use anyhow::{Context, Result};
use async_trait::async_trait;
use mongodb::error::{Error as MongoError, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT};
use mongodb::options::{Acknowledgment, TransactionOptions, WriteConcern};
use mongodb::{Client, ClientSession, Collection, Database};
use std::time::Duration;
use tracing::{debug, warn};

use crate::bson::{doc, Document};
use crate::config::StoreConfig;
use crate::{id_filter, DocumentStore, Durability, Filter, TxnOptions};

/// Document store backed by a MongoDB replica set
pub struct MongoStore {
    client: Client,
    database: Database,
    max_commit_time: Option<Duration>,
    max_txn_retries: u32,
}

impl MongoStore {
    pub async fn connect(uri: &str, config: &StoreConfig) -> Result<Self> {
        let client = Client::with_uri_str(uri)
            .await
            .with_context(|| format!("Failed to connect to {}", uri))?;
        let database = client.database(&config.database);

        Ok(Self {
            client,
            database,
            max_commit_time: config.max_commit_time(),
            max_txn_retries: config.max_txn_retries,
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }

    fn transaction_options(&self, options: &TxnOptions) -> TransactionOptions {
        let w = match options.durability {
            Durability::Acknowledged => Acknowledgment::Nodes(1),
            Durability::Majority => Acknowledgment::Majority,
        };

        TransactionOptions::builder()
            .write_concern(WriteConcern::builder().w(w).build())
            .max_commit_time(self.max_commit_time)
            .build()
    }

    async fn run_mutation(
        collection: &Collection<Document>,
        session: &mut ClientSession,
        id: i64,
        mutation: &mut (dyn FnMut(Document) -> Result<Option<Document>> + Send),
    ) -> Result<bool> {
        let Some(current) = collection
            .find_one(id_filter(id))
            .session(&mut *session)
            .await?
        else {
            return Ok(false);
        };

        if let Some(replacement) = mutation(current)? {
            collection
                .replace_one(id_filter(id), replacement)
                .session(&mut *session)
                .await?;
        }

        Ok(true)
    }

    /// Commit, retrying while the outcome of the commit is unknown
    async fn commit(&self, session: &mut ClientSession) -> Result<()> {
        let mut attempt = 0;
        loop {
            match session.commit_transaction().await {
                Ok(()) => return Ok(()),
                Err(e)
                    if attempt < self.max_txn_retries
                        && e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT) =>
                {
                    attempt += 1;
                    debug!("Retrying commit with unknown result: {}", e);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn is_transient(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<MongoError>()
        .is_some_and(|e| e.contains_label(TRANSIENT_TRANSACTION_ERROR))
}

#[async_trait]
impl DocumentStore for MongoStore {
    async fn insert(&self, collection: &str, document: Document) -> Result<()> {
        self.collection(collection).insert_one(document).await?;
        Ok(())
    }

    async fn delete_one(&self, collection: &str, id: i64) -> Result<u64> {
        let result = self.collection(collection).delete_one(id_filter(id)).await?;
        Ok(result.deleted_count)
    }

    async fn find_one(&self, collection: &str, id: i64) -> Result<Option<Document>> {
        Ok(self.collection(collection).find_one(id_filter(id)).await?)
    }

    async fn replace_one(&self, collection: &str, id: i64, document: Document) -> Result<u64> {
        let result = self
            .collection(collection)
            .replace_one(id_filter(id), document)
            .await?;
        Ok(result.modified_count)
    }

    async fn update_many(&self, collection: &str, filter: &Filter, set: Document) -> Result<u64> {
        let result = self
            .collection(collection)
            .update_many(filter.to_document(), doc! { "$set": set })
            .await?;
        Ok(result.modified_count)
    }

    async fn with_transaction(
        &self,
        collection: &str,
        id: i64,
        options: &TxnOptions,
        mutation: &mut (dyn FnMut(Document) -> Result<Option<Document>> + Send),
    ) -> Result<bool> {
        let collection = self.collection(collection);
        let mut session = self.client.start_session().await?;

        let mut attempt = 0;
        loop {
            session
                .start_transaction()
                .with_options(self.transaction_options(options))
                .await?;

            let outcome = match Self::run_mutation(&collection, &mut session, id, mutation).await {
                Ok(found) => self.commit(&mut session).await.map(|_| found),
                Err(e) => {
                    if let Err(abort) = session.abort_transaction().await {
                        debug!("Abort after failed transaction: {}", abort);
                    }
                    Err(e)
                }
            };

            match outcome {
                Err(e) if attempt < self.max_txn_retries && is_transient(&e) => {
                    attempt += 1;
                    warn!("Retrying transaction on {} after: {}", id, e);
                }
                outcome => return outcome,
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}
