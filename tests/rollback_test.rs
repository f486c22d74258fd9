mod common;

use common::{ns, wait_for, wait_until, Harness, WAIT};
use oplog_replicator::ledger::LedgerStore;
use oplog_replicator::oplog::{Document, DocumentId, ReplicatedDocument};
use oplog_replicator::{DocManager, LedgerEntry, Timestamp};
use serde_json::json;

#[tokio::test]
async fn test_failover_restores_rolled_back_document() {
    let h = Harness::new(2);
    let foo = ns("test.foo");
    let a = DocumentId::new("A");

    let t1 = h.rs.insert(&foo, json!({"_id": "A", "v": 1})).unwrap();
    let worker = h.worker();
    let stats = worker.stats();
    let handle = worker.start();
    assert!(wait_until(WAIT, || h.target.get(&foo, &a).is_some()).await);

    // These writes only reach the old primary.
    h.rs.pause_replication().unwrap();
    h.rs.update(&foo, &a, json!({"v": 2})).unwrap();
    let t3 = h.rs.delete(&foo, &a).unwrap();
    assert!(wait_until(WAIT, || h.target.get(&foo, &a).is_none()).await);
    let harness = &h;
    assert!(
        wait_for(WAIT, move || async move { harness.ledger_ts().await == Some(t3) }).await
    );

    h.rs.fail_over().unwrap();
    assert!(wait_until(WAIT, || h.target.get(&foo, &a).is_some()).await);

    let restored = h.target.get(&foo, &a).unwrap();
    assert_eq!(restored.get("v"), Some(&json!(1)));
    assert_eq!(restored.ts, t1.as_u64());

    // Tailing continues on the new primary.
    let t4 = h.rs.insert(&foo, json!({"_id": "B"})).unwrap();
    assert!(wait_until(WAIT, || h.target.get(&foo, &DocumentId::new("B")).is_some()).await);

    handle.stop();
    handle.join().await.unwrap();
    assert_eq!(stats.snapshot().rollbacks, 1);
    assert_eq!(h.ledger_ts().await, Some(t4));
}

#[tokio::test]
async fn test_failover_removes_unreplicated_insert() {
    let h = Harness::new(3);
    let foo = ns("test.foo");
    let a = DocumentId::new("A");
    let b = DocumentId::new("B");

    let t1 = h.rs.insert(&foo, json!({"_id": "A"})).unwrap();
    let handle = h.worker().start();
    assert!(wait_until(WAIT, || h.target.get(&foo, &a).is_some()).await);

    h.rs.pause_replication().unwrap();
    h.rs.insert(&foo, json!({"_id": "B"})).unwrap();
    assert!(wait_until(WAIT, || h.target.get(&foo, &b).is_some()).await);

    h.rs.fail_over().unwrap();
    assert!(wait_until(WAIT, || h.target.get(&foo, &b).is_none()).await);

    handle.stop();
    handle.join().await.unwrap();

    let kept = h.target.get(&foo, &a).unwrap();
    assert_eq!(kept.ts, t1.as_u64());
    assert_eq!(h.ledger_ts().await, Some(t1));
}

fn replicated(id: &str, ts: Timestamp, fields: serde_json::Value) -> ReplicatedDocument {
    let fields: Document = fields.as_object().cloned().unwrap();
    ReplicatedDocument::new(DocumentId::new(id), ns("test.foo"), ts, fields)
}

#[tokio::test]
async fn test_rollback_reconciles_target_with_source() {
    let h = Harness::new(1);
    let foo = ns("test.foo");
    let t1 = h.rs.insert(&foo, json!({"_id": "kept", "v": "source"})).unwrap();

    // The target holds writes from a history the source no longer has.
    let future = Timestamp::new(t1.time + 100, 1);
    h.target
        .upsert(replicated("kept", future, json!({"v": "rolled back"})))
        .await
        .unwrap();
    h.target
        .upsert(replicated("ghost", future, json!({"v": "never existed"})))
        .await
        .unwrap();
    h.target.commit().await.unwrap();

    let mut worker = h.worker();
    let cutoff = worker.rollback().await.unwrap();
    assert_eq!(cutoff, Some(t1));
    assert_eq!(worker.checkpoint().commit_ts, Some(t1));
    assert_eq!(h.ledger_ts().await, Some(t1));

    let docs = h.target.documents();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].id, DocumentId::new("kept"));
    assert_eq!(docs[0].get("v"), Some(&json!("source")));
    assert_eq!(docs[0].ts, t1.as_u64());

    // A second pass finds nothing left to correct.
    assert_eq!(worker.rollback().await.unwrap(), Some(t1));
    assert_eq!(h.target.documents(), docs);
    assert_eq!(worker.stats().snapshot().rollbacks, 2);
}

#[tokio::test]
async fn test_rollback_without_common_point() {
    let h = Harness::new(1);
    let foo = ns("test.foo");
    h.rs.insert(&foo, json!({"_id": "a", "v": 2})).unwrap();

    let ancient = Timestamp::new(1, 1);
    h.target
        .upsert(replicated("a", ancient, json!({"v": 1})))
        .await
        .unwrap();
    h.target
        .upsert(replicated("gone", ancient, json!({})))
        .await
        .unwrap();
    h.target.commit().await.unwrap();

    let mut worker = h.worker();
    assert_eq!(worker.rollback().await.unwrap(), None);
    assert_eq!(worker.checkpoint().commit_ts, None);

    let docs = h.target.documents();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].get("v"), Some(&json!(2)));
    assert_eq!(docs[0].ts, 0);

    // With no common point the next start dumps from scratch.
    let cursor = worker.prepare_for_sync().await.unwrap().unwrap();
    let latest = worker.last_timestamp().await.unwrap().unwrap();
    assert_eq!(cursor.start(), latest);
    assert_eq!(h.target.documents()[0].ts, latest.as_u64());
}

#[tokio::test]
async fn test_rollback_with_empty_target_is_noop() {
    let h = Harness::new(1);
    h.rs.insert(&ns("test.foo"), json!({"_id": "a"})).unwrap();

    let mut worker = h.worker();
    assert_eq!(worker.rollback().await.unwrap(), None);
    assert!(h.target.documents().is_empty());
    assert_eq!(worker.stats().snapshot().rollbacks, 0);
}

#[tokio::test]
async fn test_diverged_ledger_position_rolls_back_on_start() {
    let h = Harness::new(2);
    let foo = ns("test.foo");
    let a = DocumentId::new("a");
    let t1 = h.rs.insert(&foo, json!({"_id": "a", "v": 1})).unwrap();

    h.rs.pause_replication().unwrap();
    let lost = h.rs.update(&foo, &a, json!({"v": 2})).unwrap();

    // A previous run replicated the write that is about to be lost.
    let mut worker = h.worker();
    worker.prepare_for_sync().await.unwrap();
    h.target
        .upsert(replicated("a", lost, json!({"v": 2})))
        .await
        .unwrap();
    h.target.commit().await.unwrap();
    h.ledger.store().save(&LedgerEntry::new("rs0", lost)).await.unwrap();
    drop(worker);

    h.rs.fail_over().unwrap();

    let mut worker = h.worker();
    let cursor = worker.prepare_for_sync().await.unwrap().unwrap();
    assert_eq!(cursor.start(), t1);
    assert_eq!(worker.checkpoint().commit_ts, Some(t1));

    let doc = h.target.get(&foo, &a).unwrap();
    assert_eq!(doc.get("v"), Some(&json!(1)));
    assert_eq!(doc.ts, t1.as_u64());
    assert_eq!(worker.stats().snapshot().rollbacks, 1);
}
