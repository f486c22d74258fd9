use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::OplogWorker;
use crate::doc_manager::DocManager;
use crate::ledger::LedgerStore;
use crate::oplog::{NamespaceSet, OplogEntry};
use crate::source::OplogSource;
use crate::{Result, Timestamp};

/// Tailing read position in one oplog.
///
/// The cursor delivers in-scope entries strictly after its position. It
/// holds no server-side state; the position advances as batches are
/// handed out.
pub struct OplogCursor<S> {
    source: Arc<S>,
    scope: NamespaceSet,
    start: Timestamp,
    position: Timestamp,
}

impl<S: OplogSource> OplogCursor<S> {
    pub(crate) fn new(source: Arc<S>, scope: NamespaceSet, start: Timestamp) -> Self {
        Self {
            source,
            scope,
            start,
            position: start,
        }
    }

    /// Timestamp the cursor was opened at.
    pub fn start(&self) -> Timestamp {
        self.start
    }

    /// Timestamp of the last entry handed out.
    pub fn position(&self) -> Timestamp {
        self.position
    }

    /// Number of in-scope entries after the current position.
    pub async fn count(&self) -> Result<u64> {
        self.source.count_after(self.position, &self.scope).await
    }

    /// Next batch of at most `limit` entries, waiting up to `max_await`.
    pub async fn next_batch(&mut self, limit: usize, max_await: Duration) -> Result<Vec<OplogEntry>> {
        let batch = self
            .source
            .read_after(self.position, &self.scope, limit, max_await)
            .await?;
        if let Some(last) = batch.last() {
            self.position = last.ts;
        }
        Ok(batch)
    }

    pub async fn next(&mut self, max_await: Duration) -> Result<Option<OplogEntry>> {
        Ok(self.next_batch(1, max_await).await?.pop())
    }

    /// Moves the read position back to `ts` so later entries are delivered
    /// again.
    pub(crate) fn seek(&mut self, ts: Timestamp) {
        self.position = ts;
    }
}

/// Where a resume timestamp sits relative to the primary's oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResumePoint {
    /// The exact entry is still there.
    Present,
    /// Older than anything retained.
    Stale,
    /// Inside the retained range but absent: that history was rolled back.
    Diverged,
}

impl<S, D, L> OplogWorker<S, D, L>
where
    S: OplogSource,
    D: DocManager,
    L: LedgerStore,
{
    async fn locate(&self, ts: Timestamp) -> Result<ResumePoint> {
        match self.source.oldest_timestamp().await? {
            None => return Ok(ResumePoint::Stale),
            Some(oldest) if ts < oldest => return Ok(ResumePoint::Stale),
            Some(_) => {}
        }
        if self.source.contains(ts).await? {
            Ok(ResumePoint::Present)
        } else {
            Ok(ResumePoint::Diverged)
        }
    }

    /// Opens a cursor delivering entries strictly after `from`.
    ///
    /// Returns `None` when there is no position to resume from or when the
    /// position has rotated out of the oplog. A position missing from the
    /// primary's history triggers rollback recovery, and the cursor opens at
    /// the recovered common point instead.
    pub async fn open_cursor(&mut self, from: Option<Timestamp>) -> Result<Option<OplogCursor<S>>> {
        let Some(mut ts) = from else {
            return Ok(None);
        };
        loop {
            match self.locate(ts).await? {
                ResumePoint::Present => {
                    debug!(%ts, "cursor opened");
                    return Ok(Some(OplogCursor::new(
                        Arc::clone(&self.source),
                        self.settings.scope.clone(),
                        ts,
                    )));
                }
                ResumePoint::Stale => {
                    warn!(%ts, "resume point is older than the oplog");
                    return Ok(None);
                }
                ResumePoint::Diverged => {
                    warn!(%ts, "resume point missing from the primary's history, rolling back");
                    match self.recover(Some(ts)).await? {
                        Some(cutoff) => ts = cutoff,
                        None => return Ok(None),
                    }
                }
            }
        }
    }
}
