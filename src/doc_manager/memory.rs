use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::trace;

use super::{DocManager, SearchQuery};
use crate::oplog::{DocumentId, Namespace, ReplicatedDocument};
use crate::{Error, Result};

type Key = (Namespace, DocumentId);

enum Pending {
    Upsert(ReplicatedDocument),
    Remove(Key),
}

#[derive(Default)]
struct State {
    committed: BTreeMap<Key, ReplicatedDocument>,
    pending: Vec<Pending>,
}

/// In-memory document manager.
///
/// Writes are staged until [`commit`](DocManager::commit), mirroring an
/// indexing backend whose searches only see committed segments. The
/// manager can be switched unavailable to exercise retry paths.
pub struct MemoryDocManager {
    state: Mutex<State>,
    available: AtomicBool,
}

impl Default for MemoryDocManager {
    fn default() -> Self {
        Self {
            state: Mutex::new(State::default()),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryDocManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every call fails with [`Error::Target`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Committed documents ordered by namespace and id.
    pub fn documents(&self) -> Vec<ReplicatedDocument> {
        self.state
            .lock()
            .map(|state| state.committed.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, ns: &Namespace, id: &DocumentId) -> Option<ReplicatedDocument> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.committed.get(&(ns.clone(), id.clone())).cloned())
    }

    pub fn pending_writes(&self) -> usize {
        self.state.lock().map(|state| state.pending.len()).unwrap_or(0)
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::Target("document manager unavailable".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| Error::Target("document manager state poisoned".to_string()))
    }
}

#[async_trait]
impl DocManager for MemoryDocManager {
    async fn upsert(&self, document: ReplicatedDocument) -> Result<()> {
        trace!(ns = %document.ns, id = %document.id, ts = document.ts, "upsert");
        self.state()?.pending.push(Pending::Upsert(document));
        Ok(())
    }

    async fn remove(&self, ns: &Namespace, id: &DocumentId) -> Result<()> {
        trace!(%ns, %id, "remove");
        self.state()?
            .pending
            .push(Pending::Remove((ns.clone(), id.clone())));
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ReplicatedDocument>> {
        Ok(self
            .state()?
            .committed
            .values()
            .filter(|doc| query.matches(doc))
            .cloned()
            .collect())
    }

    async fn commit(&self) -> Result<()> {
        let mut state = self.state()?;
        let pending = std::mem::take(&mut state.pending);
        for write in pending {
            match write {
                Pending::Upsert(doc) => {
                    state
                        .committed
                        .insert((doc.ns.clone(), doc.id.clone()), doc);
                }
                Pending::Remove(key) => {
                    state.committed.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::Document;
    use crate::Timestamp;
    use serde_json::json;

    fn replicated(id: &str, ts: u64, name: &str) -> ReplicatedDocument {
        let fields = json!({ "name": name }).as_object().cloned().unwrap_or_else(Document::new);
        ReplicatedDocument::new(
            DocumentId::new(id),
            Namespace::new("alpha", "foo"),
            Timestamp::from_u64(ts),
            fields,
        )
    }

    #[tokio::test]
    async fn test_writes_visible_after_commit() {
        let manager = MemoryDocManager::new();
        manager.upsert(replicated("a", 1, "paulie")).await.unwrap();
        assert!(manager.search(&SearchQuery::all()).await.unwrap().is_empty());
        assert_eq!(manager.pending_writes(), 1);

        manager.commit().await.unwrap();
        let docs = manager.search(&SearchQuery::all()).await.unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].get("name"), Some(&json!("paulie")));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_and_ordered() {
        let manager = MemoryDocManager::new();
        let doc = replicated("a", 1, "paulie");
        manager.upsert(doc.clone()).await.unwrap();
        manager.upsert(doc.clone()).await.unwrap();
        manager.upsert(replicated("a", 2, "paul")).await.unwrap();
        manager
            .remove(&Namespace::new("alpha", "foo"), &DocumentId::new("missing"))
            .await
            .unwrap();
        manager.commit().await.unwrap();

        let docs = manager.documents();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].ts, 2);

        let last = manager.last_document(&SearchQuery::all()).await.unwrap();
        assert_eq!(last.map(|d| d.ts), Some(2));
    }

    #[tokio::test]
    async fn test_unavailable() {
        let manager = MemoryDocManager::new();
        manager.set_available(false);
        assert!(matches!(
            manager.upsert(replicated("a", 1, "x")).await,
            Err(Error::Target(_))
        ));
        manager.set_available(true);
        assert!(manager.commit().await.is_ok());
    }
}
