//! Per-shard oplog worker.
//!
//! One worker tails one replica set's oplog and applies every in-scope
//! entry to the document manager, in order. Its lifecycle:
//!
//! ```text
//!   prepare_for_sync ──> tail batch ──> apply entries ──> maybe persist
//!        ^                   │
//!        │                   ├─ primary changed ─────> flush, renegotiate
//!        │                   ├─ cursor invalidated ──> resync
//!        └───────────────────┴─ transient failure ──> backoff
//! ```
//!
//! The checkpoint only moves past an entry once that entry has been fully
//! applied, and the ledger only records a checkpoint after the document
//! manager has committed everything up to it. A restarted worker therefore
//! replays at most the entries after the last persisted checkpoint, and
//! replay is idempotent because every write reflects the current source
//! version of the document.

mod cursor;
mod dump;
mod rollback;

pub use cursor::OplogCursor;

use std::slice;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::doc_manager::{DocManager, SearchQuery};
use crate::ledger::{LedgerSlot, LedgerStore};
use crate::oplog::{
    Command, Document, DocumentId, Namespace, NamespaceSet, Operation, OplogEntry,
    ReplicatedDocument,
};
use crate::retry::{sleep_or_shutdown, Backoff, RetryConfig};
use crate::source::OplogSource;
use crate::stats::{StatsSnapshot, WorkerStats};
use crate::{Error, Result, Timestamp};

use self::rollback::RollbackJournal;

/// Tuning knobs of a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub scope: NamespaceSet,
    pub batch_size: usize,
    /// Maximum time a tailing read waits for new entries.
    pub poll_interval: Duration,
    pub checkpoint_interval: Duration,
    pub checkpoint_max_entries: usize,
    pub dump_batch_size: usize,
    pub rollback_window: usize,
    pub retry: RetryConfig,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            scope: NamespaceSet::unrestricted(),
            batch_size: 500,
            poll_interval: Duration::from_secs(1),
            checkpoint_interval: Duration::from_secs(10),
            checkpoint_max_entries: 1000,
            dump_batch_size: 1000,
            rollback_window: 10_000,
            retry: RetryConfig::daemon(),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let replication = &config.replication;
        Ok(Self {
            scope: config.namespace_set()?,
            batch_size: replication.batch_size,
            poll_interval: replication.poll_interval(),
            checkpoint_interval: replication.checkpoint_interval(),
            checkpoint_max_entries: replication.checkpoint_max_entries,
            dump_batch_size: replication.dump_batch_size,
            rollback_window: replication.rollback_window,
            retry: RetryConfig::from(&config.retry),
        })
    }
}

/// Cloneable stop switch for a worker.
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl StopSignal {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

pub struct OplogWorker<S, D, L>
where
    S: OplogSource,
    D: DocManager,
    L: LedgerStore,
{
    source: Arc<S>,
    doc_manager: Arc<D>,
    ledger: LedgerSlot<L>,
    settings: WorkerSettings,
    checkpoint: Checkpoint,
    journal: RollbackJournal,
    stats: Arc<WorkerStats>,
    /// Primary the current cursor was negotiated against.
    primary: Option<String>,
    /// Last checkpoint written to the ledger.
    persisted: Option<Timestamp>,
    unpersisted: usize,
    last_persist: Instant,
    stop_tx: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
}

impl<S, D, L> OplogWorker<S, D, L>
where
    S: OplogSource,
    D: DocManager,
    L: LedgerStore,
{
    pub fn new(
        source: Arc<S>,
        doc_manager: Arc<D>,
        ledger: LedgerSlot<L>,
        settings: WorkerSettings,
    ) -> Self {
        let (stop_tx, shutdown) = watch::channel(false);
        let journal = RollbackJournal::new(settings.rollback_window);
        Self {
            source,
            doc_manager,
            ledger,
            settings,
            checkpoint: Checkpoint::new(),
            journal,
            stats: Arc::new(WorkerStats::new()),
            primary: None,
            persisted: None,
            unpersisted: 0,
            last_persist: Instant::now(),
            stop_tx: Arc::new(stop_tx),
            shutdown,
        }
    }

    pub fn source_identity(&self) -> &str {
        self.ledger.source()
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    /// Sets the resume position used when the ledger has no entry for this
    /// source.
    pub fn set_checkpoint(&mut self, commit_ts: Option<Timestamp>) {
        self.checkpoint.reset(commit_ts);
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal {
            tx: Arc::clone(&self.stop_tx),
        }
    }

    fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Timestamp of the newest oplog entry, `None` for an empty oplog.
    pub async fn last_timestamp(&self) -> Result<Option<Timestamp>> {
        Ok(self.source.latest_entry().await?.map(|entry| entry.ts))
    }

    /// Current source version of the document an insert or update refers
    /// to. `None` for other entries, for documents that no longer exist and
    /// when the lookup is not unique.
    pub async fn resolve_document(&self, entry: &OplogEntry) -> Result<Option<Document>> {
        match entry.operation() {
            Ok(Operation::Insert { ns, id, .. }) | Ok(Operation::Update { ns, id }) => {
                self.resolve(&ns, &id).await
            }
            Ok(_) => Ok(None),
            Err(e) => {
                debug!(ts = %entry.ts, error = %e, "cannot resolve malformed entry");
                Ok(None)
            }
        }
    }

    async fn resolve(&self, ns: &Namespace, id: &DocumentId) -> Result<Option<Document>> {
        let mut found = self.source.find_by_ids(ns, slice::from_ref(id)).await?;
        found.retain(|doc| DocumentId::of(doc).as_ref() == Some(id));
        match found.len() {
            1 => Ok(found.pop()),
            0 => Ok(None),
            n => {
                warn!(%ns, %id, matches = n, "document lookup is ambiguous, treating as missing");
                Ok(None)
            }
        }
    }

    /// Chooses where tailing starts: the ledger entry for this source, then
    /// an explicitly set checkpoint, then a full dump.
    pub async fn initialize_cursor(&mut self) -> Result<Option<OplogCursor<S>>> {
        let resume = match self.ledger.read().await? {
            Some(ts) => {
                debug!(%ts, "resuming from ledger");
                self.persisted = Some(ts);
                Some(ts)
            }
            None => self.checkpoint.commit_ts,
        };

        if let Some(ts) = resume {
            if let Some(cursor) = self.open_cursor(Some(ts)).await? {
                return Ok(Some(cursor));
            }
            warn!(%ts, "cannot resume from checkpoint, performing full resync");
            self.stats.record_resync();
        }

        let since = self.last_timestamp().await?;
        let cursor = self.bootstrap(since).await?;
        if let Some(cursor) = &cursor {
            self.checkpoint.reset(Some(cursor.start()));
            self.persist(cursor.start()).await?;
        }
        Ok(cursor)
    }

    /// Negotiates a cursor and aligns the checkpoint with its start
    /// position.
    pub async fn prepare_for_sync(&mut self) -> Result<Option<OplogCursor<S>>> {
        let cursor = self.initialize_cursor().await?;
        if let Some(cursor) = &cursor {
            self.checkpoint.reset(Some(cursor.start()));
            self.unpersisted = 0;
            info!(position = %cursor.start(), "cursor ready");
        }
        Ok(cursor)
    }

    /// Spawns the main loop on the runtime.
    pub fn start(mut self) -> WorkerHandle {
        let source = self.source_identity().to_string();
        let stop = self.stop_signal();
        let stats = self.stats();
        let task = tokio::spawn(async move { self.run().await });
        WorkerHandle {
            source,
            stop,
            stats,
            task,
        }
    }

    /// Runs until stopped or until a non-recoverable error.
    pub async fn run(&mut self) -> Result<()> {
        let span = info_span!("worker", source = %self.source_identity());
        self.run_loop().instrument(span).await
    }

    async fn run_loop(&mut self) -> Result<()> {
        info!("Oplog worker starting");
        let mut cursor = None;
        let mut backoff = Backoff::new(self.settings.retry.clone());

        while !self.is_stopping() {
            match self.step(&mut cursor).await {
                Ok(()) => backoff.reset(),
                Err(Error::Shutdown) => break,
                Err(e @ Error::CursorInvalidated { .. }) => {
                    warn!(error = %e, "cursor invalidated, resynchronising");
                    self.stats.record_resync();
                    if let Err(e) = self.flush_checkpoint().await {
                        warn!(error = %e, "checkpoint flush before resync failed");
                    }
                    cursor = None;
                }
                Err(e) if e.is_transient() => {
                    self.stats.record_transient_error();
                    let Some(delay) = backoff.next_delay() else {
                        error!(error = %e, "giving up after {} attempts", backoff.attempt());
                        return Err(e);
                    };
                    warn!(error = %e, attempt = backoff.attempt(), delay_ms = delay.as_millis() as u64, "transient failure, backing off");
                    match sleep_or_shutdown(delay, &mut self.shutdown).await {
                        Ok(()) => {}
                        Err(Error::Shutdown) => break,
                        Err(other) => return Err(other),
                    }
                }
                Err(e) => {
                    error!(error = %e, "worker stopped by unrecoverable error");
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.flush_checkpoint().await {
            warn!(error = %e, "final checkpoint flush failed");
        }
        info!(checkpoint = ?self.checkpoint.commit_ts, "Oplog worker stopped");
        Ok(())
    }

    async fn step(&mut self, cursor: &mut Option<OplogCursor<S>>) -> Result<()> {
        let primary = self.source.primary().await?;

        if cursor.is_some() && self.primary.as_deref() != Some(primary.as_str()) {
            return self.renegotiate(cursor, &primary).await;
        }

        if cursor.is_none() {
            match self.prepare_for_sync().await? {
                Some(fresh) => {
                    *cursor = Some(fresh);
                    self.primary = Some(primary);
                }
                None => {
                    debug!("nothing to replicate yet");
                    return sleep_or_shutdown(self.settings.poll_interval, &mut self.shutdown).await;
                }
            }
        }
        let Some(active) = cursor.as_mut() else {
            return Ok(());
        };

        let resume = active.position();
        let batch = tokio::select! {
            biased;
            _ = self.shutdown.changed() => return Err(Error::Shutdown),
            batch = active.next_batch(self.settings.batch_size, self.settings.poll_interval) => batch?,
        };

        if batch.is_empty() {
            return self.maybe_persist(true).await;
        }

        // A failover during the read may have served entries from a history
        // the cursor was not negotiated against.
        match self.source.primary().await {
            Ok(current) if self.primary.as_deref() != Some(current.as_str()) => {
                return self.renegotiate(cursor, &current).await;
            }
            Ok(_) => {}
            Err(e) => {
                active.seek(resume);
                return Err(e);
            }
        }

        debug!(entries = batch.len(), "applying batch");
        for entry in &batch {
            if let Err(e) = self.process(entry).await {
                // Entries after the checkpoint must be read again.
                active.seek(self.checkpoint.commit_ts.unwrap_or(resume));
                return Err(e);
            }
        }
        Ok(())
    }

    async fn process(&mut self, entry: &OplogEntry) -> Result<()> {
        self.apply_with_retry(entry).await?;
        if self.checkpoint.advance(entry.ts) {
            self.unpersisted += 1;
        }
        self.maybe_persist(false).await
    }

    async fn renegotiate(&mut self, cursor: &mut Option<OplogCursor<S>>, current: &str) -> Result<()> {
        warn!(previous = ?self.primary, %current, "primary changed, renegotiating cursor");
        *cursor = None;
        self.primary = None;
        self.flush_checkpoint().await
    }

    async fn apply_with_retry(&mut self, entry: &OplogEntry) -> Result<()> {
        let mut backoff = Backoff::new(self.settings.retry.clone());
        loop {
            match self.apply_entry(entry).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    self.stats.record_transient_error();
                    let Some(delay) = backoff.next_delay() else {
                        return Err(e);
                    };
                    warn!(ts = %entry.ts, error = %e, attempt = backoff.attempt(), "apply failed, retrying");
                    sleep_or_shutdown(delay, &mut self.shutdown).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Applies one entry. Malformed entries are logged and skipped.
    async fn apply_entry(&mut self, entry: &OplogEntry) -> Result<()> {
        let operation = match entry.operation() {
            Ok(operation) => operation,
            Err(e) => {
                warn!(ts = %entry.ts, ns = %entry.ns, error = %e, "skipping malformed oplog entry");
                self.stats.record_skipped();
                return Ok(());
            }
        };

        match operation {
            Operation::Insert { ns, id, .. } | Operation::Update { ns, id } => {
                match self.resolve(&ns, &id).await? {
                    Some(document) => {
                        self.doc_manager
                            .upsert(ReplicatedDocument::new(id.clone(), ns.clone(), entry.ts, document))
                            .await?
                    }
                    None => self.doc_manager.remove(&ns, &id).await?,
                }
                self.journal.record(entry.ts, ns, id);
            }
            Operation::Delete { ns, id } => {
                self.doc_manager.remove(&ns, &id).await?;
                self.journal.record(entry.ts, ns, id);
            }
            Operation::Noop => {}
            Operation::Command(command) => self.apply_command(command, entry.ts).await?,
        }
        self.stats.record_applied();
        Ok(())
    }

    async fn apply_command(&mut self, command: Command, ts: Timestamp) -> Result<()> {
        match command {
            Command::Drop(ns) => {
                if self.settings.scope.contains(&ns) {
                    self.purge_namespace(&ns, ts).await?;
                }
            }
            Command::DropDatabase(database) => {
                for ns in self.namespaces_in_database(&database).await? {
                    self.purge_namespace(&ns, ts).await?;
                }
            }
            Command::Rename { from, to } => {
                if self.settings.scope.contains(&from) {
                    self.purge_namespace(&from, ts).await?;
                }
                if self.settings.scope.contains(&to) {
                    let copied = self.dump_namespace(&to, ts).await?;
                    self.stats.record_dumped(copied);
                }
            }
            Command::Create(ns) => debug!(%ns, "collection created"),
            Command::Other { database, name } => {
                debug!(%database, command = %name, "ignoring command");
            }
        }
        Ok(())
    }

    async fn namespaces_in_database(&self, database: &str) -> Result<Vec<Namespace>> {
        if !self.settings.scope.is_unrestricted() {
            return Ok(self.settings.scope.in_database(database).cloned().collect());
        }
        self.doc_manager.commit().await?;
        let mut namespaces: Vec<Namespace> = self
            .doc_manager
            .search(&SearchQuery::all())
            .await?
            .into_iter()
            .map(|doc| doc.ns)
            .filter(|ns| ns.database() == database)
            .collect();
        namespaces.sort();
        namespaces.dedup();
        Ok(namespaces)
    }

    /// Removes every target document of `ns`.
    async fn purge_namespace(&mut self, ns: &Namespace, ts: Timestamp) -> Result<()> {
        self.doc_manager.commit().await?;
        let documents = self
            .doc_manager
            .search(&SearchQuery::in_namespaces([ns]))
            .await?;
        info!(%ns, documents = documents.len(), "removing dropped collection");
        for document in documents {
            self.doc_manager.remove(ns, &document.id).await?;
            self.journal.record(ts, ns.clone(), document.id);
        }
        Ok(())
    }

    async fn maybe_persist(&mut self, idle: bool) -> Result<()> {
        let due = self.unpersisted >= self.settings.checkpoint_max_entries
            || (self.unpersisted > 0
                && (idle || self.last_persist.elapsed() >= self.settings.checkpoint_interval));
        if due {
            self.flush_checkpoint().await?;
        }
        Ok(())
    }

    /// Commits the document manager and records the checkpoint in the
    /// ledger.
    pub async fn flush_checkpoint(&mut self) -> Result<()> {
        let Some(ts) = self.checkpoint.commit_ts else {
            return Ok(());
        };
        self.doc_manager.commit().await?;
        if self.persisted != Some(ts) {
            self.persist(ts).await?;
        }
        self.unpersisted = 0;
        self.last_persist = Instant::now();

        if let Ok(Some(latest)) = self.last_timestamp().await {
            self.stats.set_lag_seconds(latest.seconds_since(ts));
        }
        Ok(())
    }

    async fn persist(&mut self, ts: Timestamp) -> Result<()> {
        self.ledger.write(ts).await?;
        self.persisted = Some(ts);
        self.stats.record_checkpoint();
        debug!(%ts, "checkpoint persisted");
        Ok(())
    }
}

/// Handle to a spawned worker.
pub struct WorkerHandle {
    source: String,
    stop: StopSignal,
    stats: Arc<WorkerStats>,
    task: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Requests a graceful stop; the worker finishes the entry it is
    /// applying and flushes its checkpoint.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub async fn join(self) -> Result<()> {
        self.task.await?
    }
}

