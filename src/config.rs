use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::oplog::NamespaceSet;
use crate::retry::RetryConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub replication: ReplicationConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplicationConfig {
    /// `db.collection` names to replicate; empty replicates every user
    /// collection.
    #[serde(default)]
    pub namespaces: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
    #[serde(default = "default_checkpoint_max_entries")]
    pub checkpoint_max_entries: usize,
    #[serde(default = "default_dump_batch_size")]
    pub dump_batch_size: usize,
    /// Number of recently applied document writes remembered for rollback.
    #[serde(default = "default_rollback_window")]
    pub rollback_window: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LedgerConfig {
    /// Directory holding one progress file per oplog source.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// 0 retries forever.
    #[serde(default)]
    pub max_attempts: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            namespaces: Vec::new(),
            batch_size: default_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
            checkpoint_max_entries: default_checkpoint_max_entries(),
            dump_batch_size: default_dump_batch_size(),
            rollback_window: default_rollback_window(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            max_attempts: 0,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("OPLOG_REPLICATOR")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let replication = &self.replication;
        if replication.batch_size == 0 {
            return Err(Error::InvalidConfig("replication.batch_size must be > 0".into()));
        }
        if replication.dump_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "replication.dump_batch_size must be > 0".into(),
            ));
        }
        if replication.checkpoint_max_entries == 0 {
            return Err(Error::InvalidConfig(
                "replication.checkpoint_max_entries must be > 0".into(),
            ));
        }
        if self.retry.backoff_factor < 1.0 {
            return Err(Error::InvalidConfig("retry.backoff_factor must be >= 1.0".into()));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::InvalidConfig(
                "retry.initial_delay_ms exceeds retry.max_delay_ms".into(),
            ));
        }
        self.namespace_set().map(|_| ())
    }

    pub fn namespace_set(&self) -> Result<NamespaceSet> {
        NamespaceSet::from_names(&self.replication.namespaces)
    }
}

impl ReplicationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig {
            max_attempts: match settings.max_attempts {
                0 => usize::MAX,
                n => n,
            },
            initial_delay: Duration::from_millis(settings.initial_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_factor: settings.backoff_factor,
        }
    }
}

fn default_batch_size() -> usize {
    500
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_checkpoint_interval_secs() -> u64 {
    10
}

fn default_checkpoint_max_entries() -> usize {
    1000
}

fn default_dump_batch_size() -> usize {
    1000
}

fn default_rollback_window() -> usize {
    10_000
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_factor() -> f64 {
    2.0
}
