use sled::Db;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Write-behind requests for the embedded store's sled files.
///
/// Every collection maps to one sled tree; documents are keyed by the
/// big-endian bytes of their `_id` and stored as raw BSON.
pub(crate) enum StorageMessage {
    Put {
        collection: String,
        id: i64,
        bytes: Vec<u8>,
    },
    Delete {
        collection: String,
        id: i64,
    },
    Flush {
        reply_tx: oneshot::Sender<()>,
    },
}

type PendingWrite = (String, i64, Option<Vec<u8>>);

pub(crate) struct Storage {
    // Persistence sled database
    db: Db,
    // Channel receiver for incoming storage requests
    storage_rx: mpsc::UnboundedReceiver<StorageMessage>,
    // Batching configuration
    max_batch_size: usize,
    flush_interval: Duration,
}

impl Storage {
    pub(crate) fn new(
        db: Db,
        storage_rx: mpsc::UnboundedReceiver<StorageMessage>,
        max_batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        Self {
            db,
            storage_rx,
            max_batch_size,
            flush_interval,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut batch: Vec<PendingWrite> = Vec::new();
        let mut last_flush = Instant::now();

        while let Some(msg) = self.storage_rx.recv().await {
            match msg {
                StorageMessage::Put {
                    collection,
                    id,
                    bytes,
                } => {
                    batch.push((collection, id, Some(bytes)));

                    if batch.len() >= self.max_batch_size {
                        self.flush_batch(&mut batch);
                        last_flush = Instant::now();
                    }
                }
                StorageMessage::Delete { collection, id } => {
                    batch.push((collection, id, None));

                    if batch.len() >= self.max_batch_size {
                        self.flush_batch(&mut batch);
                        last_flush = Instant::now();
                    }
                }
                StorageMessage::Flush { reply_tx } => {
                    if !batch.is_empty() {
                        self.flush_batch(&mut batch);
                    }

                    // Ensure data is written to disk
                    if let Err(e) = self.db.flush() {
                        error!("Failed to flush database: {}", e);
                    }
                    debug!("Database flushed");

                    if reply_tx.send(()).is_err() {
                        warn!("Failed to send flush acknowledgement");
                    }

                    last_flush = Instant::now();
                }
            }

            // Time-based flush check
            if !batch.is_empty() && last_flush.elapsed() >= self.flush_interval {
                self.flush_batch(&mut batch);
                last_flush = Instant::now();
            }
        }

        if !batch.is_empty() {
            self.flush_batch(&mut batch);
        }
        if let Err(e) = self.db.flush() {
            error!("Failed to flush database: {}", e);
        }

        info!("Storage service stopped");
    }

    fn flush_batch(&self, batch: &mut Vec<PendingWrite>) {
        for (collection, id, bytes) in batch.drain(..) {
            let tree = match self.db.open_tree(collection.as_bytes()) {
                Ok(tree) => tree,
                Err(e) => {
                    error!("Failed to open tree {}: {}", collection, e);
                    continue;
                }
            };

            match bytes {
                Some(bytes) => {
                    if let Err(e) = tree.insert(id.to_be_bytes(), bytes) {
                        error!("Failed to persist {}/{}: {}", collection, id, e);
                    }
                }
                None => {
                    if let Err(e) = tree.remove(id.to_be_bytes()) {
                        error!("Failed to persist delete of {}/{}: {}", collection, id, e);
                    }
                }
            }
        }
    }
}
