use tracing::{debug, info, warn};

use super::{OplogCursor, OplogWorker};
use crate::doc_manager::DocManager;
use crate::ledger::LedgerStore;
use crate::oplog::{DocumentId, Namespace, ReplicatedDocument};
use crate::source::OplogSource;
use crate::{Error, Result, Timestamp};

impl<S, D, L> OplogWorker<S, D, L>
where
    S: OplogSource,
    D: DocManager,
    L: LedgerStore,
{
    /// Copies this replica set's part of every in-scope collection into the
    /// target, tagging each document with `since`, then opens a cursor at
    /// `since`. Documents held by other shards are left to their workers.
    ///
    /// `since` must be taken before the copy starts: writes that race with
    /// the dump are then replayed from the oplog. Returns `None` without
    /// copying anything for an empty oplog.
    pub async fn bootstrap(&mut self, since: Option<Timestamp>) -> Result<Option<OplogCursor<S>>> {
        let Some(since) = since else {
            debug!("oplog is empty, nothing to dump");
            return Ok(None);
        };

        let namespaces = self.dump_namespaces().await?;
        info!(%since, collections = namespaces.len(), "dumping collections");

        let mut total = 0;
        for ns in &namespaces {
            total += self.dump_namespace(ns, since).await?;
        }
        self.doc_manager.commit().await?;
        self.stats.record_dumped(total);
        info!(documents = total, "dump complete");

        self.open_cursor(Some(since)).await
    }

    async fn dump_namespaces(&self) -> Result<Vec<Namespace>> {
        if self.settings.scope.is_unrestricted() {
            let namespaces = self.source.list_namespaces().await?;
            Ok(namespaces
                .into_iter()
                .filter(|ns| self.settings.scope.contains(ns))
                .collect())
        } else {
            Ok(self.settings.scope.iter().cloned().collect())
        }
    }

    /// Upserts every document of `ns`, paging through the collection in id
    /// order. Returns the number of documents written.
    pub(super) async fn dump_namespace(&mut self, ns: &Namespace, since: Timestamp) -> Result<u64> {
        let page_size = self.settings.dump_batch_size.max(1);
        let mut after: Option<DocumentId> = None;
        let mut count = 0;

        loop {
            if self.is_stopping() {
                return Err(Error::Shutdown);
            }
            let page = self.source.scan(ns, after.as_ref(), page_size).await?;
            let full_page = page.len() >= page_size;
            let mut advanced = false;

            for document in page {
                let Some(id) = DocumentId::of(&document) else {
                    warn!(%ns, "skipping document without a usable _id");
                    continue;
                };
                after = Some(id.clone());
                advanced = true;
                self.doc_manager
                    .upsert(ReplicatedDocument::new(id, ns.clone(), since, document))
                    .await?;
                count += 1;
            }

            if !full_page || !advanced {
                break;
            }
        }
        debug!(%ns, documents = count, "collection dumped");
        Ok(count)
    }
}
