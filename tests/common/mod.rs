#![allow(dead_code)]

use oplog_replicator::ledger::LedgerStore;
use oplog_replicator::oplog::{Document, Namespace, NamespaceSet};
use oplog_replicator::{
    MemoryDocManager, MemoryLedgerStore, MemoryReplicaSet, OplogWorker, ProgressLedger,
    RetryConfig, Timestamp, WorkerSettings,
};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub type TestWorker = OplogWorker<MemoryReplicaSet, MemoryDocManager, MemoryLedgerStore>;

/// Settings with short intervals so tests finish quickly.
pub fn test_settings(namespaces: &[&str]) -> WorkerSettings {
    WorkerSettings {
        scope: NamespaceSet::from_names(namespaces).unwrap(),
        batch_size: 10,
        poll_interval: Duration::from_millis(20),
        checkpoint_interval: Duration::from_millis(50),
        checkpoint_max_entries: 5,
        dump_batch_size: 3,
        rollback_window: 100,
        retry: RetryConfig::testing(),
    }
}

pub fn ns(name: &str) -> Namespace {
    Namespace::parse(name).unwrap()
}

pub fn doc(value: Value) -> Document {
    value.as_object().cloned().unwrap()
}

/// A replica set, a target and a ledger wired together.
pub struct Harness {
    pub rs: Arc<MemoryReplicaSet>,
    pub target: Arc<MemoryDocManager>,
    pub ledger: ProgressLedger<MemoryLedgerStore>,
}

impl Harness {
    pub fn new(members: usize) -> Self {
        Self::with_replica_set(MemoryReplicaSet::new("rs0", members))
    }

    pub fn with_replica_set(rs: MemoryReplicaSet) -> Self {
        Self {
            rs: Arc::new(rs),
            target: Arc::new(MemoryDocManager::new()),
            ledger: ProgressLedger::new(MemoryLedgerStore::new()),
        }
    }

    pub fn worker(&self) -> TestWorker {
        self.worker_with(test_settings(&[]))
    }

    pub fn worker_with(&self, settings: WorkerSettings) -> TestWorker {
        let slot = self.ledger.claim(self.rs.name()).unwrap();
        OplogWorker::new(Arc::clone(&self.rs), Arc::clone(&self.target), slot, settings)
    }

    pub async fn ledger_ts(&self) -> Option<Timestamp> {
        self.ledger
            .store()
            .load(self.rs.name())
            .await
            .unwrap()
            .map(|entry| entry.timestamp())
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub const WAIT: Duration = Duration::from_secs(5);

/// Synchronous-condition variant of [`wait_for`].
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    wait_for(timeout, || {
        let holds = condition();
        async move { holds }
    })
    .await
}
