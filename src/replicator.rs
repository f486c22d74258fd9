//! Top-level coordination: one worker per shard, all writing into one
//! document manager and one progress ledger.

use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info};

use crate::doc_manager::DocManager;
use crate::ledger::{LedgerStore, ProgressLedger};
use crate::source::OplogSource;
use crate::stats::StatsSnapshot;
use crate::worker::{OplogWorker, WorkerHandle, WorkerSettings};
use crate::{Error, Result};

pub struct Replicator<S, D, L>
where
    S: OplogSource,
    D: DocManager,
    L: LedgerStore,
{
    settings: WorkerSettings,
    doc_manager: Arc<D>,
    ledger: ProgressLedger<L>,
    shards: Vec<Arc<S>>,
    workers: Vec<WorkerHandle>,
}

impl<S, D, L> Replicator<S, D, L>
where
    S: OplogSource,
    D: DocManager,
    L: LedgerStore,
{
    pub fn new(settings: WorkerSettings, doc_manager: Arc<D>, ledger: ProgressLedger<L>) -> Self {
        Self {
            settings,
            doc_manager,
            ledger,
            shards: Vec::new(),
            workers: Vec::new(),
        }
    }

    pub fn add_shard(&mut self, source: Arc<S>) -> &mut Self {
        self.shards.push(source);
        self
    }

    pub fn ledger(&self) -> &ProgressLedger<L> {
        &self.ledger
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Spawns a worker per shard.
    ///
    /// # Errors
    ///
    /// Fails without starting anything if two shards report the same
    /// identity or if the replicator is already running.
    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(Error::InvalidConfig("replicator already running".into()));
        }

        let mut slots = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            slots.push((Arc::clone(shard), self.ledger.claim(shard.identity())?));
        }

        for (shard, slot) in slots {
            let worker = OplogWorker::new(
                shard,
                Arc::clone(&self.doc_manager),
                slot,
                self.settings.clone(),
            );
            self.workers.push(worker.start());
        }
        info!(workers = self.workers.len(), "Replicator started");
        Ok(())
    }

    /// Stops every worker and waits for them. Returns the first worker
    /// error, after all workers have finished.
    pub async fn stop(&mut self) -> Result<()> {
        for worker in &self.workers {
            worker.stop();
        }
        let workers = std::mem::take(&mut self.workers);
        let sources: Vec<String> = workers.iter().map(|w| w.source().to_string()).collect();
        let results = join_all(workers.into_iter().map(WorkerHandle::join)).await;

        let mut first_error = None;
        for (source, result) in sources.into_iter().zip(results) {
            if let Err(e) = result {
                error!(%source, error = %e, "worker failed");
                first_error.get_or_insert(e);
            }
        }
        info!("Replicator stopped");
        first_error.map_or(Ok(()), Err)
    }

    /// Starts, waits for `shutdown`, then stops.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        shutdown.await;
        self.stop().await
    }

    /// Counters of every running worker, keyed by source identity.
    pub fn stats(&self) -> Vec<(String, StatsSnapshot)> {
        self.workers
            .iter()
            .map(|w| (w.source().to_string(), w.stats()))
            .collect()
    }
}
