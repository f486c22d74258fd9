//! Source-side contract: one replica set (a shard, or the whole cluster
//! when unsharded) and its oplog.
//!
//! Oplog reads are per replica set and always go to its current primary.
//! `find_by_ids` observes the current state of the whole cluster, the way a
//! query router would, so a document that migrated to another shard is
//! still found. `find_local_by_ids`, `scan` and `list_namespaces` only see
//! the data held by this replica set, so that a shard never dumps or
//! rewrites documents another shard's oplog is responsible for.

pub mod memory;

pub use memory::{MemoryCluster, MemoryReplicaSet, MemoryShard};

use async_trait::async_trait;
use std::time::Duration;

use crate::oplog::{Document, DocumentId, Namespace, NamespaceSet, OplogEntry};
use crate::{Result, Timestamp};

#[async_trait]
pub trait OplogSource: Send + Sync + 'static {
    /// Stable identity of this oplog stream, used as the progress ledger key.
    fn identity(&self) -> &str;

    /// Name of the member currently acting as primary.
    async fn primary(&self) -> Result<String>;

    /// Newest entry in the primary's oplog.
    async fn latest_entry(&self) -> Result<Option<OplogEntry>>;

    /// Timestamp of the oldest entry still retained.
    async fn oldest_timestamp(&self) -> Result<Option<Timestamp>>;

    /// Whether the primary's oplog holds an entry at exactly `ts`.
    async fn contains(&self, ts: Timestamp) -> Result<bool>;

    /// Greatest retained timestamp that is `<= ts`.
    async fn latest_at_or_before(&self, ts: Timestamp) -> Result<Option<Timestamp>>;

    /// Up to `limit` entries strictly after `after` that `scope` admits, in
    /// oplog order. Waits up to `max_await` for new entries when there are
    /// none; an empty result means the wait timed out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CursorInvalidated`](crate::Error::CursorInvalidated)
    /// when `after` is older than the oldest retained entry.
    async fn read_after(
        &self,
        after: Timestamp,
        scope: &NamespaceSet,
        limit: usize,
        max_await: Duration,
    ) -> Result<Vec<OplogEntry>>;

    /// Number of entries strictly after `after` that `scope` admits.
    async fn count_after(&self, after: Timestamp, scope: &NamespaceSet) -> Result<u64>;

    /// Current versions of the given documents, wherever in the cluster they
    /// live. Missing ids are absent from the result.
    async fn find_by_ids(&self, ns: &Namespace, ids: &[DocumentId]) -> Result<Vec<Document>>;

    /// Like [`find_by_ids`](Self::find_by_ids), restricted to documents held
    /// by this replica set. Identical for an unsharded deployment.
    async fn find_local_by_ids(&self, ns: &Namespace, ids: &[DocumentId]) -> Result<Vec<Document>> {
        self.find_by_ids(ns, ids).await
    }

    /// One page of this replica set's part of a collection, ordered by id
    /// and starting after `after`.
    async fn scan(
        &self,
        ns: &Namespace,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>>;

    /// Non-empty user collections held by this replica set.
    async fn list_namespaces(&self) -> Result<Vec<Namespace>>;
}
