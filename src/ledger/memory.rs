use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{LedgerEntry, LedgerStore};
use crate::{Error, Result, Timestamp};

/// Ledger store kept in process memory. Nothing survives a restart; meant
/// for tests and for embedding where durability is provided elsewhere.
#[derive(Debug, Default)]
pub struct MemoryLedgerStore {
    entries: Mutex<BTreeMap<String, LedgerEntry>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds progress for the given sources.
    pub fn seeded<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, Timestamp)>,
        S: Into<String>,
    {
        let entries = entries
            .into_iter()
            .map(|(source, ts)| {
                let entry = LedgerEntry::new(source, ts);
                (entry.source.clone(), entry)
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, LedgerEntry>>> {
        self.entries.lock().map_err(|_| Error::Ledger {
            message: "memory ledger poisoned".to_string(),
        })
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load(&self, source: &str) -> Result<Option<LedgerEntry>> {
        Ok(self.lock()?.get(source).cloned())
    }

    async fn load_all(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.lock()?.values().cloned().collect())
    }

    async fn save(&self, entry: &LedgerEntry) -> Result<()> {
        self.lock()?.insert(entry.source.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, source: &str) -> Result<bool> {
        Ok(self.lock()?.remove(source).is_some())
    }
}
