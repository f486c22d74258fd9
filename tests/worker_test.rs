mod common;

use common::{doc, ns, test_settings, Harness};
use oplog_replicator::ledger::LedgerStore;
use oplog_replicator::oplog::{DocumentId, OplogEntry};
use oplog_replicator::{
    DocManager, LedgerEntry, MemoryDocManager, MemoryLedgerStore, MemoryReplicaSet, OplogSource,
    ProgressLedger, SearchQuery,
};
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_last_timestamp() {
    let h = Harness::new(1);
    let worker = h.worker();
    assert_eq!(worker.last_timestamp().await.unwrap(), None);

    let foo = ns("test.foo");
    h.rs.insert(&foo, json!({"_id": "a"})).unwrap();
    let t2 = h.rs.insert(&foo, json!({"_id": "b"})).unwrap();
    assert_eq!(worker.last_timestamp().await.unwrap(), Some(t2));
}

#[tokio::test]
async fn test_resolve_document() {
    let h = Harness::new(1);
    let worker = h.worker();
    let foo = ns("test.foo");
    let a = DocumentId::new("a");

    let t1 = h.rs.insert(&foo, json!({"_id": "a", "name": "paulie"})).unwrap();
    let insert = OplogEntry::insert(t1, &foo, doc(json!({"_id": "a", "name": "paulie"})));
    let resolved = worker.resolve_document(&insert).await.unwrap().unwrap();
    assert_eq!(resolved["name"], "paulie");

    // An update resolves to the document's current version, not the entry
    // payload.
    let t2 = h.rs.update(&foo, &a, json!({"name": "paul"})).unwrap();
    let update = OplogEntry::update(t2, &foo, &a, doc(json!({"name": "stale"})));
    let resolved = worker.resolve_document(&update).await.unwrap().unwrap();
    assert_eq!(resolved["name"], "paul");
    assert_eq!(worker.resolve_document(&insert).await.unwrap().unwrap()["name"], "paul");

    let t3 = h.rs.delete(&foo, &a).unwrap();
    assert!(worker.resolve_document(&insert).await.unwrap().is_none());
    assert!(worker
        .resolve_document(&OplogEntry::delete(t3, &foo, &a))
        .await
        .unwrap()
        .is_none());
    assert!(worker
        .resolve_document(&OplogEntry::noop(t3, "heartbeat"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_open_cursor() {
    let h = Harness::new(1);
    let mut worker = h.worker();
    let foo = ns("test.foo");

    assert!(worker.open_cursor(None).await.unwrap().is_none());

    let t1 = h.rs.insert(&foo, json!({"_id": "a"})).unwrap();
    let cursor = worker.open_cursor(Some(t1)).await.unwrap().unwrap();
    assert_eq!(cursor.count().await.unwrap(), 0);

    h.rs.insert(&foo, json!({"_id": "b"})).unwrap();
    let t3 = h.rs.insert(&foo, json!({"_id": "c"})).unwrap();
    let cursor = worker.open_cursor(Some(t1)).await.unwrap().unwrap();
    assert_eq!(cursor.count().await.unwrap(), 2);

    let cursor = worker.open_cursor(Some(t3)).await.unwrap().unwrap();
    assert_eq!(cursor.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_open_cursor_on_rotated_position() {
    let h = Harness::with_replica_set(MemoryReplicaSet::new("rs0", 1).with_oplog_capacity(2));
    let mut worker = h.worker();
    let foo = ns("test.foo");

    let t1 = h.rs.insert(&foo, json!({"_id": "a"})).unwrap();
    h.rs.insert(&foo, json!({"_id": "b"})).unwrap();
    h.rs.insert(&foo, json!({"_id": "c"})).unwrap();

    assert!(worker.open_cursor(Some(t1)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_bootstrap_tags_documents() {
    let h = Harness::new(1);
    let mut worker = h.worker_with(test_settings(&["test.foo"]));
    let foo = ns("test.foo");
    let bar = ns("test.bar");

    assert!(worker.bootstrap(None).await.unwrap().is_none());
    assert!(h.target.documents().is_empty());

    for i in 0..7 {
        h.rs.insert(&foo, json!({"_id": format!("doc{}", i), "n": i})).unwrap();
    }
    h.rs.insert(&bar, json!({"_id": "ignored"})).unwrap();
    let since = worker.last_timestamp().await.unwrap().unwrap();

    let cursor = worker.bootstrap(Some(since)).await.unwrap().unwrap();
    assert_eq!(cursor.start(), since);
    assert_eq!(cursor.count().await.unwrap(), 0);

    let docs = h.target.documents();
    assert_eq!(docs.len(), 7);
    for d in &docs {
        assert_eq!(d.ns, foo);
        assert_eq!(d.ts, since.as_u64());
    }
    assert_eq!(worker.stats().snapshot().documents_dumped, 7);
}

#[tokio::test]
async fn test_initialize_cursor_without_ledger() {
    let h = Harness::new(1);
    let mut worker = h.worker();
    let t1 = h.rs.insert(&ns("test.foo"), json!({"_id": "a", "name": "paulie"})).unwrap();

    let cursor = worker.initialize_cursor().await.unwrap().unwrap();
    assert_eq!(cursor.count().await.unwrap(), 0);
    assert_eq!(worker.checkpoint().commit_ts, Some(t1));
    assert_eq!(h.ledger_ts().await, Some(t1));

    let dumped = h.target.documents();
    assert_eq!(dumped.len(), 1);
    assert_eq!(dumped[0].ts, t1.as_u64());
}

#[tokio::test]
async fn test_initialize_cursor_prefers_ledger() {
    let rs = Arc::new(MemoryReplicaSet::new("rs0", 1));
    let foo = ns("test.foo");
    let t1 = rs.insert(&foo, json!({"_id": "a"})).unwrap();
    let t2 = rs.insert(&foo, json!({"_id": "b"})).unwrap();
    let t3 = rs.insert(&foo, json!({"_id": "c"})).unwrap();

    let h = Harness {
        rs,
        target: Arc::new(MemoryDocManager::new()),
        ledger: ProgressLedger::new(MemoryLedgerStore::seeded([("rs0", t1)])),
    };
    let mut worker = h.worker();
    worker.set_checkpoint(Some(t2));

    let cursor = worker.initialize_cursor().await.unwrap().unwrap();
    assert_eq!(cursor.start(), t1);
    assert_eq!(cursor.count().await.unwrap(), 2);
    assert!(h.target.documents().is_empty(), "resuming must not dump");
    assert_eq!(worker.stats().snapshot().documents_dumped, 0);

    drop(worker);
    h.ledger.reset("rs0").await.unwrap();
    let mut worker = h.worker();
    worker.set_checkpoint(Some(t2));
    let cursor = worker.initialize_cursor().await.unwrap().unwrap();
    assert_eq!(cursor.start(), t2);
    assert_eq!(cursor.count().await.unwrap(), 1);
    assert!(t3 > t2);
}

#[tokio::test]
async fn test_stale_checkpoint_forces_resync() {
    let h = Harness::with_replica_set(MemoryReplicaSet::new("rs0", 1).with_oplog_capacity(3));
    let foo = ns("test.foo");
    let t1 = h.rs.insert(&foo, json!({"_id": "a"})).unwrap();
    for i in 0..5 {
        h.rs.insert(&foo, json!({"_id": format!("b{}", i)})).unwrap();
    }
    let latest = h.rs.latest_entry().await.unwrap().unwrap().ts;
    h.ledger.store().save(&LedgerEntry::new("rs0", t1)).await.unwrap();

    let mut worker = h.worker();
    let cursor = worker.initialize_cursor().await.unwrap().unwrap();
    assert_eq!(cursor.start(), latest);
    assert_eq!(h.target.documents().len(), 6);
    assert_eq!(h.ledger_ts().await, Some(latest));

    let stats = worker.stats().snapshot();
    assert_eq!(stats.resyncs, 1);
    assert_eq!(stats.documents_dumped, 6);
}

#[tokio::test]
async fn test_prepare_for_sync() {
    let h = Harness::new(1);
    let mut worker = h.worker();

    assert!(worker.prepare_for_sync().await.unwrap().is_none());
    assert_eq!(worker.checkpoint().commit_ts, None);
    assert_eq!(h.ledger_ts().await, None);

    let foo = ns("test.foo");
    h.rs.insert(&foo, json!({"_id": "a"})).unwrap();
    let t2 = h.rs.insert(&foo, json!({"_id": "b"})).unwrap();

    let cursor = worker.prepare_for_sync().await.unwrap().unwrap();
    assert_eq!(worker.checkpoint().commit_ts, Some(t2));
    assert_eq!(cursor.start(), t2);
    assert_eq!(cursor.count().await.unwrap(), 0);

    let ids: Vec<_> = h
        .target
        .search(&SearchQuery::in_namespaces([&foo]))
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(ids, vec![DocumentId::new("a"), DocumentId::new("b")]);
}

#[tokio::test]
async fn test_duplicate_worker_refused() {
    let h = Harness::new(1);
    let _worker = h.worker();
    assert!(h.ledger.claim("rs0").is_err());
}
