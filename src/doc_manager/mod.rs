//! Target-store contract.
//!
//! A [`DocManager`] is the indexing system replicated documents end up in.
//! The replicator only relies on the capabilities below; the concrete
//! backend is chosen when the worker is constructed (it is a generic
//! parameter, not a runtime switch).
//!
//! Contract:
//! - `upsert` is idempotent by `(ns, _id)` and stores `_ts` exactly
//! - `remove` of a missing document succeeds
//! - `search` and `last_document` observe everything written before the
//!   most recent `commit`
//! - concurrent calls for different documents are safe; several workers
//!   share one manager

pub mod memory;

pub use memory::MemoryDocManager;

use async_trait::async_trait;

use crate::oplog::{DocumentId, Namespace, ReplicatedDocument};
use crate::{Result, Timestamp};

/// Selection of target documents by namespace and minimum `_ts`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    /// Namespaces to search; empty means all.
    pub namespaces: Vec<Namespace>,
    /// Exclusive lower bound on `_ts`.
    pub newer_than: Option<u64>,
}

impl SearchQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn in_namespaces<'a, I>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = &'a Namespace>,
    {
        Self {
            namespaces: namespaces.into_iter().cloned().collect(),
            ..Self::default()
        }
    }

    pub fn newer_than(mut self, ts: Timestamp) -> Self {
        self.newer_than = Some(ts.as_u64());
        self
    }

    pub fn matches(&self, document: &ReplicatedDocument) -> bool {
        (self.namespaces.is_empty() || self.namespaces.contains(&document.ns))
            && self.newer_than.map_or(true, |low| document.ts > low)
    }
}

#[async_trait]
pub trait DocManager: Send + Sync + 'static {
    /// Inserts or replaces the document identified by `(ns, _id)`.
    async fn upsert(&self, document: ReplicatedDocument) -> Result<()>;

    /// Removes the document identified by `(ns, id)` if present.
    async fn remove(&self, ns: &Namespace, id: &DocumentId) -> Result<()>;

    /// Committed documents matching `query`.
    async fn search(&self, query: &SearchQuery) -> Result<Vec<ReplicatedDocument>>;

    /// Makes every prior write durable and visible to `search`.
    async fn commit(&self) -> Result<()>;

    /// The committed document with the greatest `_ts` matching `query`.
    async fn last_document(&self, query: &SearchQuery) -> Result<Option<ReplicatedDocument>> {
        Ok(self
            .search(query)
            .await?
            .into_iter()
            .max_by_key(|doc| doc.ts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oplog::Document;

    fn replicated(ns: &Namespace, id: &str, ts: u64) -> ReplicatedDocument {
        ReplicatedDocument::new(
            DocumentId::new(id),
            ns.clone(),
            Timestamp::from_u64(ts),
            Document::new(),
        )
    }

    #[test]
    fn test_query_bounds() {
        let foo = Namespace::new("alpha", "foo");
        let bar = Namespace::new("alpha", "bar");

        let query = SearchQuery::in_namespaces([&foo])
            .newer_than(Timestamp::from_u64(10));

        assert!(!query.matches(&replicated(&foo, "a", 10)));
        assert!(query.matches(&replicated(&foo, "a", 11)));
        assert!(query.matches(&replicated(&foo, "a", u64::MAX)));
        assert!(!query.matches(&replicated(&bar, "a", 15)));

        assert!(SearchQuery::all().matches(&replicated(&bar, "a", 0)));
    }
}
