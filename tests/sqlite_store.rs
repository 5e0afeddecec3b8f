use std::sync::Arc;
use std::time::Duration;

use basekit_idempotency::{
    CachedResponse, IdempotencyExecutor, IdempotencyKey, IdempotencyRecord, InsertOutcome,
    ResponseCache, ResponseStore, SqliteResponseStore, StoreOutcome,
};
use chrono::{TimeDelta, Utc};
use serde_json::json;
use tempfile::tempdir;

mod support;
use support::*;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn open(path: &std::path::Path) -> Arc<dyn ResponseStore> {
    Arc::new(SqliteResponseStore::open(path, BUSY_TIMEOUT).expect("open sqlite store"))
}

#[tokio::test]
async fn racing_instances_persist_one_response() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idempotency.db");
    // two handles on one file stand in for two service instances
    let first = ResponseCache::new(open(&path));
    let second = ResponseCache::new(open(&path));
    let key = IdempotencyKey::new("rotate", "key-1");

    let r1 = CachedResponse::ok(json!({"secret": "one"}));
    let r2 = CachedResponse::ok(json!({"secret": "two"}));
    let (a, b) = tokio::join!(
        first.store(&key, &r1, None),
        second.store(&key, &r2, None)
    );

    let stored = [&a, &b]
        .iter()
        .filter(|outcome| ***outcome == StoreOutcome::Stored)
        .count();
    assert_eq!(stored, 1, "outcomes: {a:?} {b:?}");

    let winner = first.lookup(&key).await.unwrap().cached_response.unwrap();
    assert!(winner == r1 || winner == r2);
    for cache in [&first, &second] {
        for _ in 0..3 {
            let seen = cache.lookup(&key).await.unwrap().cached_response;
            assert_eq!(seen.as_ref(), Some(&winner));
        }
    }
    match (a, b) {
        (StoreOutcome::AlreadyPresent(existing), _) | (_, StoreOutcome::AlreadyPresent(existing)) => {
            assert_eq!(existing, winner)
        }
        other => panic!("expected one conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn records_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idempotency.db");
    let key = IdempotencyKey::parse("revoke:key-123");
    let response = CachedResponse::ok(json!({"revoked": true})).with_header("X-Trace", "t-1");

    {
        let store = open(&path);
        let record = IdempotencyRecord::new(
            key.clone(),
            response.clone(),
            Utc::now(),
            Duration::from_secs(31_536_000),
        );
        assert_eq!(
            store.insert_if_absent(record).await.unwrap(),
            InsertOutcome::Inserted
        );
    }

    let reopened = open(&path);
    let record = reopened.fetch(&key).await.unwrap().expect("persisted");
    assert_eq!(record.response, response);
    assert_eq!(record.key, key);
    assert!(record.expires_at > record.created_at);
}

#[tokio::test]
async fn purge_removes_only_expired_rows() {
    let dir = tempdir().unwrap();
    let store = open(&dir.path().join("idempotency.db"));
    let now = Utc::now();
    let old = now - TimeDelta::seconds(3_600);

    for (key, created, ttl) in [
        ("rotate:stale", old, 300),
        ("revoke:stale", old, 60),
        ("revoke:fresh", now, 31_536_000),
    ] {
        store
            .insert_if_absent(IdempotencyRecord::new(
                IdempotencyKey::parse(key),
                CachedResponse::ok(json!({})),
                created,
                Duration::from_secs(ttl),
            ))
            .await
            .unwrap();
    }

    assert_eq!(store.purge_expired(now).await.unwrap(), 2);
    assert!(
        store
            .fetch(&IdempotencyKey::parse("rotate:stale"))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        store
            .fetch(&IdempotencyKey::parse("revoke:fresh"))
            .await
            .unwrap()
            .is_some()
    );
    assert_eq!(store.purge_expired(now).await.unwrap(), 0);
}

#[tokio::test]
async fn executor_replays_across_instances() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("idempotency.db");
    let instance_a = IdempotencyExecutor::builder().with_store(open(&path)).build();
    let instance_b = IdempotencyExecutor::builder().with_store(open(&path)).build();
    let key = IdempotencyKey::new("provision", "tenant-a/proj-1");
    let calls = CallCounter::new();

    instance_a
        .execute(
            &key,
            respond(&calls, CachedResponse::new(201, json!({"project": "proj-1"}))),
            Default::default(),
        )
        .await
        .unwrap();
    let replay = instance_b
        .execute(
            &key,
            respond(&calls, CachedResponse::ok(json!({"project": "other"}))),
            Default::default(),
        )
        .await
        .unwrap();

    assert_eq!(calls.count(), 1);
    assert!(replay.replayed);
    assert_eq!(replay.response.status, 201);
}
