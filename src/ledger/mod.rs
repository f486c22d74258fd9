//! Durable progress ledger: the last committed oplog timestamp of every
//! shard, so that each worker resumes after a restart without a full resync.
//!
//! The ledger is shared process-wide but every worker owns exactly one
//! entry. Ownership is enforced by [`ProgressLedger::claim`], which hands out
//! a single [`LedgerSlot`] per source identity; a slot can only read and
//! write its own entry. Persistence sits behind the [`LedgerStore`] trait.
//!
//! # Example
//!
//! ```rust
//! use oplog_replicator::ledger::{MemoryLedgerStore, ProgressLedger};
//! use oplog_replicator::Timestamp;
//!
//! # async fn example() -> oplog_replicator::Result<()> {
//! let ledger = ProgressLedger::new(MemoryLedgerStore::new());
//! let slot = ledger.claim("rs-alpha")?;
//!
//! assert_eq!(slot.read().await?, None);
//! slot.write(Timestamp::new(1_700_000_000, 1)).await?;
//! assert_eq!(slot.read().await?, Some(Timestamp::new(1_700_000_000, 1)));
//!
//! // A second claim for the same shard is refused while the slot is alive.
//! assert!(ledger.claim("rs-alpha").is_err());
//! # Ok(())
//! # }
//! ```

pub mod file;
pub mod memory;

pub use file::FileLedgerStore;
pub use memory::MemoryLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::{Error, Result, Timestamp};

/// One persisted row of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Identity of the oplog stream (replica set) this entry belongs to.
    pub source: String,
    /// Integer-encoded timestamp of the last entry known to be applied.
    pub commit_ts: u64,
    /// When this entry was last written.
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(source: impl Into<String>, commit_ts: Timestamp) -> Self {
        Self {
            source: source.into(),
            commit_ts: commit_ts.as_u64(),
            updated_at: Utc::now(),
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_u64(self.commit_ts)
    }
}

/// Persistence for ledger entries.
///
/// Implementations must make `save` atomic per entry: a crash during a
/// write leaves either the previous or the new value, and never disturbs
/// another source's entry.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    async fn load(&self, source: &str) -> Result<Option<LedgerEntry>>;

    async fn load_all(&self) -> Result<Vec<LedgerEntry>>;

    async fn save(&self, entry: &LedgerEntry) -> Result<()>;

    /// Removes an entry; returns whether one existed.
    async fn delete(&self, source: &str) -> Result<bool>;
}

/// Process-wide handle to the ledger.
pub struct ProgressLedger<L> {
    store: Arc<L>,
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl<L> Clone for ProgressLedger<L> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            claimed: Arc::clone(&self.claimed),
        }
    }
}

impl<L: LedgerStore> ProgressLedger<L> {
    pub fn new(store: L) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<L>) -> Self {
        Self {
            store,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<L> {
        &self.store
    }

    /// Hands out the slot for `source`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Ledger`] if another live slot already owns this
    /// source, which means two workers were configured for the same stream.
    pub fn claim(&self, source: &str) -> Result<LedgerSlot<L>> {
        let mut claimed = self.claimed.lock().map_err(|_| Error::Ledger {
            message: "ledger claim registry poisoned".to_string(),
        })?;
        if !claimed.insert(source.to_string()) {
            return Err(Error::Ledger {
                message: format!("source '{}' is already owned by a worker", source),
            });
        }
        debug!(source, "claimed ledger slot");
        Ok(LedgerSlot {
            source: source.to_string(),
            store: Arc::clone(&self.store),
            claimed: Arc::clone(&self.claimed),
        })
    }

    pub async fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let mut entries = self.store.load_all().await?;
        entries.sort_by(|a, b| a.source.cmp(&b.source));
        Ok(entries)
    }

    /// Explicit reset: forgets the progress of `source` so its next start
    /// performs a full dump. Refused while a worker owns the slot.
    pub async fn reset(&self, source: &str) -> Result<bool> {
        let in_use = self
            .claimed
            .lock()
            .map(|claimed| claimed.contains(source))
            .unwrap_or(true);
        if in_use {
            return Err(Error::Ledger {
                message: format!("cannot reset '{}' while its worker is running", source),
            });
        }
        let existed = self.store.delete(source).await?;
        if existed {
            info!(source, "reset ledger entry");
        }
        Ok(existed)
    }
}

/// A worker's exclusive view of its own ledger entry.
///
/// Dropping the slot releases the claim.
pub struct LedgerSlot<L: LedgerStore> {
    source: String,
    store: Arc<L>,
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl<L: LedgerStore> LedgerSlot<L> {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub async fn read(&self) -> Result<Option<Timestamp>> {
        Ok(self
            .store
            .load(&self.source)
            .await?
            .map(|entry| entry.timestamp()))
    }

    pub async fn write(&self, commit_ts: Timestamp) -> Result<()> {
        self.store
            .save(&LedgerEntry::new(self.source.clone(), commit_ts))
            .await
    }
}

impl<L: LedgerStore> Drop for LedgerSlot<L> {
    fn drop(&mut self) {
        if let Ok(mut claimed) = self.claimed.lock() {
            claimed.remove(&self.source);
        }
    }
}
