pub mod checkpoint;
pub mod config;
pub mod doc_manager;
pub mod error;
pub mod ledger;
pub mod oplog;
pub mod replicator;
pub mod retry;
pub mod source;
pub mod stats;
pub mod timestamp;
pub mod worker;

pub use checkpoint::Checkpoint;
pub use config::Config;
pub use doc_manager::{DocManager, MemoryDocManager, SearchQuery};
pub use error::{Error, Result};
pub use ledger::{FileLedgerStore, LedgerEntry, LedgerSlot, LedgerStore, MemoryLedgerStore, ProgressLedger};
pub use replicator::Replicator;
pub use retry::RetryConfig;
pub use source::{MemoryCluster, MemoryReplicaSet, MemoryShard, OplogSource};
pub use stats::{StatsSnapshot, WorkerStats};
pub use timestamp::Timestamp;
pub use worker::{OplogCursor, OplogWorker, StopSignal, WorkerHandle, WorkerSettings};
