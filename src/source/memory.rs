//! In-memory replica sets for tests and local runs.
//!
//! A [`MemoryReplicaSet`] keeps one oplog and one data set per member.
//! Writes go to the primary and are copied to the secondaries unless
//! replication is paused, which lets a test build a history that the next
//! primary never saw and then [`fail_over`](MemoryReplicaSet::fail_over) to
//! it. A [`MemoryCluster`] groups replica sets as shards and routes id
//! lookups across all of them.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

use super::OplogSource;
use crate::oplog::{
    Command, Document, DocumentId, Namespace, NamespaceSet, Operation, OplogEntry,
};
use crate::{Error, Result, Timestamp};

/// Seconds component of the first timestamp handed out.
const BASE_TIME: u32 = 1_700_000_000;
const WRITES_PER_SECOND: u64 = 4;

type Collections = BTreeMap<Namespace, BTreeMap<DocumentId, Document>>;

#[derive(Debug, Clone)]
struct Member {
    name: String,
    oplog: VecDeque<OplogEntry>,
    data: Collections,
}

impl Member {
    fn new(name: String) -> Self {
        Self {
            name,
            oplog: VecDeque::new(),
            data: Collections::new(),
        }
    }

    fn last_ts(&self) -> Option<Timestamp> {
        self.oplog.back().map(|entry| entry.ts)
    }

    fn append(&mut self, entry: OplogEntry, capacity: Option<usize>) {
        self.apply(&entry);
        self.oplog.push_back(entry);
        if let Some(capacity) = capacity {
            while self.oplog.len() > capacity.max(1) {
                self.oplog.pop_front();
            }
        }
    }

    fn apply(&mut self, entry: &OplogEntry) {
        let Ok(operation) = entry.operation() else {
            return;
        };
        match operation {
            Operation::Insert { ns, id, document } => {
                self.data.entry(ns).or_default().insert(id, document);
            }
            Operation::Update { ns, id } => {
                self.data.entry(ns).or_default().insert(id, entry.o.clone());
            }
            Operation::Delete { ns, id } => {
                if let Some(collection) = self.data.get_mut(&ns) {
                    collection.remove(&id);
                }
            }
            Operation::Command(Command::Drop(ns)) => {
                self.data.remove(&ns);
            }
            Operation::Command(Command::DropDatabase(database)) => {
                self.data.retain(|ns, _| ns.database() != database);
            }
            Operation::Command(Command::Rename { from, to }) => {
                if let Some(collection) = self.data.remove(&from) {
                    self.data.insert(to, collection);
                }
            }
            Operation::Command(_) | Operation::Noop => {}
        }
    }

    fn document(&self, ns: &Namespace, id: &DocumentId) -> Option<Document> {
        self.data.get(ns).and_then(|c| c.get(id)).cloned()
    }
}

struct Inner {
    members: Vec<Member>,
    primary: usize,
    sequence: u64,
    capacity: Option<usize>,
    replicating: bool,
    reachable: bool,
}

impl Inner {
    fn primary(&self) -> &Member {
        &self.members[self.primary]
    }
}

pub struct MemoryReplicaSet {
    name: String,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl MemoryReplicaSet {
    /// A replica set with `members` members (at least one); member 0 starts
    /// as primary.
    pub fn new(name: impl Into<String>, members: usize) -> Self {
        let name = name.into();
        let members = (0..members.max(1))
            .map(|i| Member::new(format!("{}-{}", name, i)))
            .collect();
        Self {
            name,
            inner: Mutex::new(Inner {
                members,
                primary: 0,
                sequence: 0,
                capacity: None,
                replicating: true,
                reachable: true,
            }),
            notify: Notify::new(),
        }
    }

    /// Caps every member's oplog at `capacity` entries; older entries rotate
    /// out.
    pub fn with_oplog_capacity(mut self, capacity: usize) -> Self {
        if let Ok(inner) = self.inner.get_mut() {
            inner.capacity = Some(capacity);
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn insert(&self, ns: &Namespace, document: Value) -> Result<Timestamp> {
        let document = into_document(document)?;
        if DocumentId::of(&document).is_none() {
            return Err(Error::invalid_entry("inserted document has no usable _id"));
        }
        self.append(|ts| OplogEntry::insert(ts, ns, document))
    }

    /// Replaces the document `id` with `document`, creating it if missing.
    pub fn update(&self, ns: &Namespace, id: &DocumentId, document: Value) -> Result<Timestamp> {
        let mut document = into_document(document)?;
        let original_id = self
            .lock()?
            .primary()
            .document(ns, id)
            .and_then(|doc| doc.get("_id").cloned())
            .unwrap_or_else(|| Value::String(id.to_string()));
        document.insert("_id".to_string(), original_id);
        self.append(|ts| OplogEntry::update(ts, ns, id, document))
    }

    pub fn delete(&self, ns: &Namespace, id: &DocumentId) -> Result<Timestamp> {
        self.append(|ts| OplogEntry::delete(ts, ns, id))
    }

    /// Runs a database command such as `{"drop": "coll"}`.
    pub fn command(&self, database: &str, command: Value) -> Result<Timestamp> {
        let command = into_document(command)?;
        self.append(|ts| OplogEntry::command(ts, database, command))
    }

    pub fn noop(&self, message: &str) -> Result<Timestamp> {
        self.append(|ts| OplogEntry::noop(ts, message))
    }

    /// Appends an arbitrary entry built for the next timestamp and applies
    /// it to every member that receives it.
    pub fn append<F>(&self, build: F) -> Result<Timestamp>
    where
        F: FnOnce(Timestamp) -> OplogEntry,
    {
        let ts = {
            let mut inner = self.lock()?;
            inner.sequence += 1;
            let ts = timestamp_for(inner.sequence);
            let entry = build(ts);
            let (primary, capacity, replicating) =
                (inner.primary, inner.capacity, inner.replicating);
            for (index, member) in inner.members.iter_mut().enumerate() {
                if index == primary || replicating {
                    member.append(entry.clone(), capacity);
                }
            }
            ts
        };
        self.notify.notify_waiters();
        Ok(ts)
    }

    /// Stops copying writes to secondaries.
    pub fn pause_replication(&self) -> Result<()> {
        self.lock()?.replicating = false;
        Ok(())
    }

    /// Catches the secondaries up with the primary and resumes copying.
    pub fn resume_replication(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let primary = inner.primary;
        let capacity = inner.capacity;
        let source = inner.members[primary].oplog.clone();
        for (index, member) in inner.members.iter_mut().enumerate() {
            if index == primary {
                continue;
            }
            let last = member.last_ts();
            for entry in source.iter().filter(|e| Some(e.ts) > last) {
                member.append(entry.clone(), capacity);
            }
        }
        inner.replicating = true;
        Ok(())
    }

    /// Elects the most up-to-date secondary. Writes it never received are
    /// lost: every other member resyncs from the new primary.
    pub fn fail_over(&self) -> Result<String> {
        let elected = {
            let mut inner = self.lock()?;
            let current = inner.primary;
            let elected = inner
                .members
                .iter()
                .enumerate()
                .filter(|(index, _)| *index != current)
                .max_by_key(|(_, member)| member.last_ts())
                .map(|(index, _)| index)
                .ok_or_else(|| {
                    Error::Connection(format!("{}: no electable member", self.name))
                })?;

            let winner = inner.members[elected].clone();
            for member in inner.members.iter_mut() {
                member.oplog = winner.oplog.clone();
                member.data = winner.data.clone();
            }
            inner.primary = elected;
            inner.replicating = true;
            winner.name
        };
        info!(replica_set = %self.name, primary = %elected, "failover");
        self.notify.notify_waiters();
        Ok(elected)
    }

    /// While unreachable every source call fails with [`Error::Connection`].
    pub fn set_reachable(&self, reachable: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.reachable = reachable;
        }
        self.notify.notify_waiters();
    }

    /// Current version of a document on the primary.
    pub fn document(&self, ns: &Namespace, id: &DocumentId) -> Option<Document> {
        self.lock().ok().and_then(|inner| inner.primary().document(ns, id))
    }

    pub fn oplog_len(&self) -> usize {
        self.lock().map(|inner| inner.primary().oplog.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Connection(format!("{}: state poisoned", self.name)))
    }

    fn connect(&self) -> Result<MutexGuard<'_, Inner>> {
        let inner = self.lock()?;
        if !inner.reachable {
            return Err(Error::Connection(format!("{}: unreachable", self.name)));
        }
        Ok(inner)
    }
}

fn timestamp_for(sequence: u64) -> Timestamp {
    let seconds = u32::try_from(sequence / WRITES_PER_SECOND).unwrap_or(u32::MAX);
    let increment = u32::try_from(sequence % WRITES_PER_SECOND).unwrap_or(0) + 1;
    Timestamp::new(BASE_TIME.saturating_add(seconds), increment)
}

fn into_document(value: Value) -> Result<Document> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(Error::invalid_entry(format!(
            "expected a document, got {}",
            other
        ))),
    }
}

#[async_trait]
impl OplogSource for MemoryReplicaSet {
    fn identity(&self) -> &str {
        &self.name
    }

    async fn primary(&self) -> Result<String> {
        Ok(self.connect()?.primary().name.clone())
    }

    async fn latest_entry(&self) -> Result<Option<OplogEntry>> {
        Ok(self.connect()?.primary().oplog.back().cloned())
    }

    async fn oldest_timestamp(&self) -> Result<Option<Timestamp>> {
        Ok(self.connect()?.primary().oplog.front().map(|e| e.ts))
    }

    async fn contains(&self, ts: Timestamp) -> Result<bool> {
        let inner = self.connect()?;
        let oplog = &inner.primary().oplog;
        Ok(oplog.binary_search_by_key(&ts, |e| e.ts).is_ok())
    }

    async fn latest_at_or_before(&self, ts: Timestamp) -> Result<Option<Timestamp>> {
        let inner = self.connect()?;
        Ok(inner
            .primary()
            .oplog
            .iter()
            .rev()
            .map(|e| e.ts)
            .find(|entry_ts| *entry_ts <= ts))
    }

    async fn read_after(
        &self,
        after: Timestamp,
        scope: &NamespaceSet,
        limit: usize,
        max_await: Duration,
    ) -> Result<Vec<OplogEntry>> {
        let deadline = Instant::now() + max_await;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let inner = self.connect()?;
                let oplog = &inner.primary().oplog;
                if let Some(oldest) = oplog.front() {
                    if after < oldest.ts {
                        return Err(Error::CursorInvalidated {
                            message: format!(
                                "{}: position {} rotated out (oldest {})",
                                self.name, after, oldest.ts
                            ),
                        });
                    }
                }
                let batch: Vec<OplogEntry> = oplog
                    .iter()
                    .filter(|e| e.ts > after && scope.admits(e))
                    .take(limit.max(1))
                    .cloned()
                    .collect();
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn count_after(&self, after: Timestamp, scope: &NamespaceSet) -> Result<u64> {
        let inner = self.connect()?;
        let count = inner
            .primary()
            .oplog
            .iter()
            .filter(|e| e.ts > after && scope.admits(e))
            .count();
        Ok(count as u64)
    }

    async fn find_by_ids(&self, ns: &Namespace, ids: &[DocumentId]) -> Result<Vec<Document>> {
        let inner = self.connect()?;
        let Some(collection) = inner.primary().data.get(ns) else {
            return Ok(Vec::new());
        };
        Ok(ids
            .iter()
            .filter_map(|id| collection.get(id).cloned())
            .collect())
    }

    async fn scan(
        &self,
        ns: &Namespace,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        let inner = self.connect()?;
        let Some(collection) = inner.primary().data.get(ns) else {
            return Ok(Vec::new());
        };
        let page = match after {
            Some(after) => collection
                .range::<DocumentId, _>((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                .take(limit)
                .map(|(_, doc)| doc.clone())
                .collect(),
            None => collection.values().take(limit).cloned().collect(),
        };
        Ok(page)
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let inner = self.connect()?;
        Ok(inner
            .primary()
            .data
            .iter()
            .filter(|(ns, docs)| !docs.is_empty() && !ns.is_system())
            .map(|(ns, _)| ns.clone())
            .collect())
    }
}

/// Replica sets acting as the shards of one cluster.
pub struct MemoryCluster {
    shards: Vec<Arc<MemoryReplicaSet>>,
}

impl MemoryCluster {
    pub fn new(shards: Vec<Arc<MemoryReplicaSet>>) -> Arc<Self> {
        Arc::new(Self { shards })
    }

    pub fn replica_set(&self, index: usize) -> Option<&Arc<MemoryReplicaSet>> {
        self.shards.get(index)
    }

    /// One oplog source per shard.
    pub fn sources(self: &Arc<Self>) -> Vec<Arc<MemoryShard>> {
        (0..self.shards.len())
            .map(|index| {
                Arc::new(MemoryShard {
                    cluster: Arc::clone(self),
                    index,
                })
            })
            .collect()
    }
}

/// A shard's oplog and data, with id lookups routed across the cluster.
pub struct MemoryShard {
    cluster: Arc<MemoryCluster>,
    index: usize,
}

impl MemoryShard {
    fn replica_set(&self) -> &MemoryReplicaSet {
        &self.cluster.shards[self.index]
    }
}

#[async_trait]
impl OplogSource for MemoryShard {
    fn identity(&self) -> &str {
        self.replica_set().identity()
    }

    async fn primary(&self) -> Result<String> {
        self.replica_set().primary().await
    }

    async fn latest_entry(&self) -> Result<Option<OplogEntry>> {
        self.replica_set().latest_entry().await
    }

    async fn oldest_timestamp(&self) -> Result<Option<Timestamp>> {
        self.replica_set().oldest_timestamp().await
    }

    async fn contains(&self, ts: Timestamp) -> Result<bool> {
        self.replica_set().contains(ts).await
    }

    async fn latest_at_or_before(&self, ts: Timestamp) -> Result<Option<Timestamp>> {
        self.replica_set().latest_at_or_before(ts).await
    }

    async fn read_after(
        &self,
        after: Timestamp,
        scope: &NamespaceSet,
        limit: usize,
        max_await: Duration,
    ) -> Result<Vec<OplogEntry>> {
        self.replica_set()
            .read_after(after, scope, limit, max_await)
            .await
    }

    async fn count_after(&self, after: Timestamp, scope: &NamespaceSet) -> Result<u64> {
        self.replica_set().count_after(after, scope).await
    }

    async fn find_by_ids(&self, ns: &Namespace, ids: &[DocumentId]) -> Result<Vec<Document>> {
        let mut found = Vec::new();
        for shard in &self.cluster.shards {
            found.extend(shard.find_by_ids(ns, ids).await?);
        }
        Ok(found)
    }

    async fn find_local_by_ids(&self, ns: &Namespace, ids: &[DocumentId]) -> Result<Vec<Document>> {
        self.replica_set().find_by_ids(ns, ids).await
    }

    async fn scan(
        &self,
        ns: &Namespace,
        after: Option<&DocumentId>,
        limit: usize,
    ) -> Result<Vec<Document>> {
        self.replica_set().scan(ns, after, limit).await
    }

    async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        self.replica_set().list_namespaces().await
    }
}
