//! Rollback recovery.
//!
//! After a failover the new primary's history may lack entries the worker
//! already applied. Recovery finds the newest timestamp both histories
//! share (the cutoff), re-reads every document this shard may have written
//! after it, and rewrites those documents from the source's current state:
//! documents held by this shard are upserted with `_ts = cutoff`, documents
//! that exist nowhere in the cluster are removed. Tailing then resumes from
//! the cutoff.
//!
//! The cutoff is derived from this worker's own positions only. Other
//! shards share the target but stamp `_ts` from their own oplog clocks.
//!
//! Candidates come from two places: target documents whose `_ts` is newer
//! than the cutoff, and a bounded journal of recent writes. The journal
//! covers deletions, which leave nothing in the target to find. Target
//! documents that currently live on another shard belong to that shard's
//! worker and are left untouched.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use tracing::{debug, info};

use super::OplogWorker;
use crate::doc_manager::{DocManager, SearchQuery};
use crate::ledger::LedgerStore;
use crate::oplog::{Document, DocumentId, Namespace, ReplicatedDocument};
use crate::source::OplogSource;
use crate::{Result, Timestamp};

/// The most recent document writes, newest last.
#[derive(Debug)]
pub(super) struct RollbackJournal {
    capacity: usize,
    writes: VecDeque<(Timestamp, Namespace, DocumentId)>,
}

impl RollbackJournal {
    pub(super) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            writes: VecDeque::new(),
        }
    }

    pub(super) fn record(&mut self, ts: Timestamp, ns: Namespace, id: DocumentId) {
        if self.capacity == 0 {
            return;
        }
        if self.writes.len() == self.capacity {
            self.writes.pop_front();
        }
        self.writes.push_back((ts, ns, id));
    }

    /// Documents written strictly after `cutoff` (all of them for `None`).
    fn written_after(&self, cutoff: Option<Timestamp>) -> impl Iterator<Item = (&Namespace, &DocumentId)> {
        self.writes
            .iter()
            .filter(move |(ts, _, _)| cutoff.map_or(true, |cutoff| *ts > cutoff))
            .map(|(_, ns, id)| (ns, id))
    }

    fn discard_after(&mut self, cutoff: Option<Timestamp>) {
        self.writes
            .retain(|(ts, _, _)| cutoff.map_or(false, |cutoff| *ts <= cutoff));
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.writes.len()
    }
}

impl<S, D, L> OplogWorker<S, D, L>
where
    S: OplogSource,
    D: DocManager,
    L: LedgerStore,
{
    /// Reconciles the target with the current primary's history and
    /// returns the cutoff tailing should resume from.
    ///
    /// Without a checkpoint of its own the worker falls back to the newest
    /// in-scope target document as the upper bound.
    ///
    /// `None` means the histories share no retained entry: every in-scope
    /// document has been re-read and the caller must bootstrap. Recovery is
    /// idempotent; if it fails half-way the checkpoint is untouched and a
    /// later attempt recomputes the same cutoff.
    pub async fn rollback(&mut self) -> Result<Option<Timestamp>> {
        self.recover(None).await
    }

    pub(super) async fn recover(&mut self, diverged: Option<Timestamp>) -> Result<Option<Timestamp>> {
        self.doc_manager.commit().await?;

        let scope_query = SearchQuery::in_namespaces(self.settings.scope.iter());
        let own_position = diverged.max(self.checkpoint.commit_ts);
        let high = match own_position {
            Some(ts) => Some(ts),
            None => self
                .doc_manager
                .last_document(&scope_query)
                .await?
                .map(|doc| doc.timestamp()),
        };
        let Some(high) = high else {
            debug!("nothing replicated yet, no rollback needed");
            return Ok(None);
        };

        let cutoff = self.source.latest_at_or_before(high).await?;
        info!(%high, cutoff = ?cutoff, "rollback recovery started");

        let stale_query = match cutoff {
            Some(cutoff) => scope_query.newer_than(cutoff),
            None => scope_query,
        };
        let mut candidates: BTreeMap<Namespace, BTreeSet<DocumentId>> = BTreeMap::new();
        for document in self.doc_manager.search(&stale_query).await? {
            candidates.entry(document.ns).or_default().insert(document.id);
        }
        for (ns, id) in self.journal.written_after(cutoff) {
            if self.settings.scope.contains(ns) {
                candidates.entry(ns.clone()).or_default().insert(id.clone());
            }
        }

        let tag = cutoff.unwrap_or_default();
        let chunk_size = self.settings.dump_batch_size.max(1);
        let (mut restored, mut removed, mut foreign) = (0u64, 0u64, 0u64);
        for (ns, ids) in candidates {
            let ids: Vec<DocumentId> = ids.into_iter().collect();
            for chunk in ids.chunks(chunk_size) {
                let mut local = index_by_id(self.source.find_local_by_ids(&ns, chunk).await?);
                let missing: Vec<DocumentId> = chunk
                    .iter()
                    .filter(|id| !local.contains_key(*id))
                    .cloned()
                    .collect();
                let elsewhere: HashSet<DocumentId> = if missing.is_empty() {
                    HashSet::new()
                } else {
                    index_by_id(self.source.find_by_ids(&ns, &missing).await?)
                        .into_keys()
                        .collect()
                };

                for id in chunk {
                    if let Some(document) = local.remove(id) {
                        self.doc_manager
                            .upsert(ReplicatedDocument::new(id.clone(), ns.clone(), tag, document))
                            .await?;
                        restored += 1;
                    } else if elsewhere.contains(id) {
                        foreign += 1;
                    } else {
                        self.doc_manager.remove(&ns, id).await?;
                        removed += 1;
                    }
                }
            }
        }
        self.doc_manager.commit().await?;

        self.journal.discard_after(cutoff);
        self.checkpoint.reset(cutoff);
        self.unpersisted = 0;
        if let Some(cutoff) = cutoff {
            self.persist(cutoff).await?;
        }
        self.stats.record_rollback();
        info!(restored, removed, foreign, cutoff = ?cutoff, "rollback recovery complete");
        Ok(cutoff)
    }
}

fn index_by_id(documents: Vec<Document>) -> HashMap<DocumentId, Document> {
    documents
        .into_iter()
        .filter_map(|doc| DocumentId::of(&doc).map(|id| (id, doc)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("test", "foo")
    }

    #[test]
    fn test_journal_is_bounded() {
        let mut journal = RollbackJournal::new(2);
        journal.record(Timestamp::new(1, 1), ns(), "a".into());
        journal.record(Timestamp::new(1, 2), ns(), "b".into());
        journal.record(Timestamp::new(1, 3), ns(), "c".into());

        assert_eq!(journal.len(), 2);
        let ids: Vec<_> = journal.written_after(None).map(|(_, id)| id.clone()).collect();
        assert_eq!(ids, vec![DocumentId::new("b"), DocumentId::new("c")]);
    }

    #[test]
    fn test_journal_cutoff() {
        let mut journal = RollbackJournal::new(10);
        journal.record(Timestamp::new(1, 1), ns(), "a".into());
        journal.record(Timestamp::new(1, 2), ns(), "b".into());
        journal.record(Timestamp::new(1, 3), ns(), "a".into());

        let after: Vec<_> = journal
            .written_after(Some(Timestamp::new(1, 1)))
            .map(|(_, id)| id.clone())
            .collect();
        assert_eq!(after, vec![DocumentId::new("b"), DocumentId::new("a")]);

        journal.discard_after(Some(Timestamp::new(1, 1)));
        assert_eq!(journal.len(), 1);

        journal.discard_after(None);
        assert_eq!(journal.len(), 0);
    }

    #[test]
    fn test_zero_capacity_journal_records_nothing() {
        let mut journal = RollbackJournal::new(0);
        journal.record(Timestamp::new(1, 1), ns(), "a".into());
        assert_eq!(journal.len(), 0);
    }
}
