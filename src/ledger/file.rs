//! File-backed ledger store.
//!
//! Every source gets its own JSON file inside the ledger directory, named
//! after the base64url encoding of the source identity. Writes never touch
//! another source's file, so workers need no coordination between them.
//!
//! # Example
//!
//! ```rust,no_run
//! use oplog_replicator::ledger::{FileLedgerStore, LedgerEntry, LedgerStore};
//! use oplog_replicator::Timestamp;
//!
//! # async fn example() -> oplog_replicator::Result<()> {
//! let store = FileLedgerStore::new("/var/lib/oplog-replicator/ledger");
//! store.save(&LedgerEntry::new("rs-alpha", Timestamp::new(1_700_000_000, 1))).await?;
//!
//! if let Some(entry) = store.load("rs-alpha").await? {
//!     println!("Resuming rs-alpha from {}", entry.timestamp());
//! }
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use super::{LedgerEntry, LedgerStore};
use crate::{Error, Result};

const ENTRY_EXTENSION: &str = "json";

pub struct FileLedgerStore {
    dir: PathBuf,
}

impl FileLedgerStore {
    /// Creates a store rooted at `dir`. The directory is created on the
    /// first write.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, source: &str) -> PathBuf {
        let name = URL_SAFE_NO_PAD.encode(source.as_bytes());
        self.dir.join(format!("{}.{}", name, ENTRY_EXTENSION))
    }

    async fn read_entry(path: &Path) -> Result<LedgerEntry> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            error!("Failed to read ledger file {:?}: {}", path, e);
            Error::Io(e)
        })?;
        serde_json::from_str::<LedgerEntry>(&content).map_err(|e| {
            error!("Failed to parse ledger file {:?}: {}", path, e);
            Error::Ledger {
                message: format!("invalid ledger file {:?}: {}", path, e),
            }
        })
    }
}

#[async_trait]
impl LedgerStore for FileLedgerStore {
    async fn load(&self, source: &str) -> Result<Option<LedgerEntry>> {
        let path = self.entry_path(source);
        if !fs::try_exists(&path).await? {
            debug!(source, "No ledger entry at {:?}", path);
            return Ok(None);
        }

        let entry = Self::read_entry(&path).await?;
        if entry.source != source {
            return Err(Error::Ledger {
                message: format!(
                    "ledger file {:?} belongs to '{}', expected '{}'",
                    path, entry.source, source
                ),
            });
        }
        debug!(source, commit_ts = %entry.timestamp(), "Loaded ledger entry");
        Ok(Some(entry))
    }

    async fn load_all(&self) -> Result<Vec<LedgerEntry>> {
        if !fs::try_exists(&self.dir).await? {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some(ENTRY_EXTENSION) {
                entries.push(Self::read_entry(&path).await?);
            }
        }
        Ok(entries)
    }

    /// Writes the entry atomically:
    /// 1. write to a temporary file next to the target
    /// 2. sync the temporary file to disk
    /// 3. rename it over the target
    async fn save(&self, entry: &LedgerEntry) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let path = self.entry_path(&entry.source);
        let temp_path = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(entry)?;
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &path).await?;

        debug!(source = %entry.source, commit_ts = %entry.timestamp(), "Saved ledger entry");
        Ok(())
    }

    async fn delete(&self, source: &str) -> Result<bool> {
        let path = self.entry_path(source);
        if fs::try_exists(&path).await? {
            fs::remove_file(&path).await?;
            info!(source, "Deleted ledger file {:?}", path);
            return Ok(true);
        }
        Ok(false)
    }
}
