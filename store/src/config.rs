use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};

use crate::{Durability, TxnOptions};

/// Default MongoDB service port, appended to hosts given without one
pub const DEFAULT_PORT: u16 = 27017;

/// Database holding the charging collections
pub const DEFAULT_DATABASE: &str = "CHARGLT_DB";

/// Collection holding one document per user
pub const DEFAULT_COLLECTION: &str = "CHARGLT_USERS";

/// Host string selecting the embedded store
const LOCAL_SCHEME: &str = "local";

/// Store configuration parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Comma separated host list, a full `mongodb://` URI, `local` or `local:<dir>`
    pub hosts: String,

    /// Port appended to hosts given without one
    pub port: u16,

    /// Database name
    pub database: String,

    /// Collection name
    pub collection: String,

    /// Upper bound on a transaction commit, left to the server when unset
    pub max_commit_time_ms: Option<u64>,

    /// How often a transaction is retried after a transient transaction error
    pub max_txn_retries: u32,

    /// Write concern every charging transaction commits with
    pub durability: Durability,

    /// Batch size for writes before the embedded store flushes to disk
    pub batch_size: usize,

    /// Timeout in milliseconds before a batch is flushed even if not full
    pub batch_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            hosts: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: DEFAULT_DATABASE.to_string(),
            collection: DEFAULT_COLLECTION.to_string(),
            max_commit_time_ms: None,
            max_txn_retries: 3,
            durability: Durability::Majority,
            batch_size: 256,
            batch_timeout_ms: 100,
        }
    }
}

/// Which store implementation a host string selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Mongo { uri: String },
    Local { path: Option<PathBuf> },
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder to construct a StoreConfig with custom values
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from a YAML string
    pub fn from_yaml_str(yaml_str: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml_str).context("Failed to parse YAML configuration")?;
        config.validate()
    }

    /// Validate the configuration
    pub fn validate(self) -> Result<Self> {
        ensure!(
            !self.hosts.trim().is_empty(),
            "hosts must not be empty"
        );

        ensure!(!self.database.is_empty(), "database must not be empty");

        ensure!(!self.collection.is_empty(), "collection must not be empty");

        ensure!(self.port > 0, "port must be greater than 0");

        ensure!(
            self.batch_size > 0,
            "batch_size must be greater than 0"
        );

        Ok(self)
    }

    /// Save configuration to a YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let yaml =
            serde_yaml::to_string(self).context("Failed to serialize configuration to YAML")?;
        fs::write(&path, yaml)
            .with_context(|| format!("Failed to write config to file: {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Override the host string given on the command line
    pub fn override_hosts(&mut self, hosts: &str) -> Result<()> {
        ensure!(!hosts.trim().is_empty(), "hosts must not be empty");
        self.hosts = hosts.trim().to_string();
        Ok(())
    }

    /// Resolve the host string into a backend
    pub fn backend(&self) -> Backend {
        let hosts = self.hosts.trim();

        if hosts == LOCAL_SCHEME {
            return Backend::Local { path: None };
        }

        if let Some(path) = hosts.strip_prefix("local:") {
            return Backend::Local {
                path: Some(PathBuf::from(path)),
            };
        }

        if hosts.starts_with("mongodb://") || hosts.starts_with("mongodb+srv://") {
            return Backend::Mongo {
                uri: hosts.to_string(),
            };
        }

        let host_list = hosts
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .map(|h| {
                if h.contains(':') {
                    h.to_string()
                } else {
                    format!("{}:{}", h, self.port)
                }
            })
            .collect::<Vec<_>>()
            .join(",");

        Backend::Mongo {
            uri: format!("mongodb://{}/", host_list),
        }
    }

    pub fn max_commit_time(&self) -> Option<Duration> {
        self.max_commit_time_ms.map(Duration::from_millis)
    }

    pub fn txn_options(&self) -> TxnOptions {
        TxnOptions {
            durability: self.durability,
        }
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the host string
    pub fn hosts(mut self, hosts: impl Into<String>) -> Self {
        self.config.hosts = hosts.into();
        self
    }

    /// Set the default port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the database name
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = database.into();
        self
    }

    /// Set the collection name
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.config.collection = collection.into();
        self
    }

    /// Set the maximum commit time in milliseconds
    pub fn max_commit_time_ms(mut self, ms: impl Into<Option<u64>>) -> Self {
        self.config.max_commit_time_ms = ms.into();
        self
    }

    /// Set the number of retries after a transient transaction error
    pub fn max_txn_retries(mut self, retries: u32) -> Self {
        self.config.max_txn_retries = retries;
        self
    }

    pub fn durability(mut self, durability: Durability) -> Self {
        self.config.durability = durability;
        self
    }

    /// Set the batch size
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the batch timeout in milliseconds
    pub fn batch_timeout_ms(mut self, timeout: u64) -> Self {
        self.config.batch_timeout_ms = timeout;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_from_hosts() {
        let config = StoreConfig::builder().hosts("db1,db2:27018").build();
        assert_eq!(
            config.backend(),
            Backend::Mongo {
                uri: "mongodb://db1:27017,db2:27018/".to_string()
            }
        );

        let config = StoreConfig::builder()
            .hosts("mongodb://user:pw@db1/?replicaSet=rs0")
            .build();
        assert_eq!(
            config.backend(),
            Backend::Mongo {
                uri: "mongodb://user:pw@db1/?replicaSet=rs0".to_string()
            }
        );

        let config = StoreConfig::builder().hosts("local").build();
        assert_eq!(config.backend(), Backend::Local { path: None });

        let config = StoreConfig::builder().hosts("local:/tmp/charglt").build();
        assert_eq!(
            config.backend(),
            Backend::Local {
                path: Some(PathBuf::from("/tmp/charglt"))
            }
        );
    }

    #[test]
    fn test_yaml_defaults_and_validation() {
        let config = StoreConfig::from_yaml_str("hosts: mongo1\nport: 27100\n").unwrap();
        assert_eq!(config.database, DEFAULT_DATABASE);
        assert_eq!(config.collection, DEFAULT_COLLECTION);
        assert_eq!(
            config.backend(),
            Backend::Mongo {
                uri: "mongodb://mongo1:27100/".to_string()
            }
        );

        assert!(StoreConfig::from_yaml_str("collection: ''\n").is_err());
        assert!(StoreConfig::from_yaml_str("batch_size: 0\n").is_err());
        assert_eq!(config.txn_options().durability, Durability::Majority);

        let mut config = StoreConfig::new();
        assert!(config.override_hosts("  ").is_err());
        config.override_hosts("local").unwrap();
        assert_eq!(config.backend(), Backend::Local { path: None });
    }

    #[test]
    fn test_yaml_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.yaml");

        let config = StoreConfig::builder()
            .hosts("db1")
            .max_commit_time_ms(500)
            .max_txn_retries(5)
            .build();
        config.to_yaml_file(&path).unwrap();

        let loaded = StoreConfig::from_yaml_file(&path).unwrap();
        assert_eq!(loaded.hosts, "db1");
        assert_eq!(loaded.max_commit_time(), Some(Duration::from_millis(500)));
        assert_eq!(loaded.max_txn_retries, 5);
    }

    #[test]
    fn test_durability_setting() {
        let config = StoreConfig::from_yaml_str("durability: acknowledged\n").unwrap();
        assert_eq!(config.durability, Durability::Acknowledged);
        assert_eq!(config.txn_options().durability, Durability::Acknowledged);

        let config = StoreConfig::from_yaml_str("durability: majority\n").unwrap();
        assert_eq!(config.txn_options().durability, Durability::Majority);

        assert!(StoreConfig::from_yaml_str("durability: eventually\n").is_err());

        let config = StoreConfig::builder()
            .durability(Durability::Acknowledged)
            .build();
        assert_eq!(config.txn_options().durability, Durability::Acknowledged);
    }
}
