#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use basekit_idempotency::cache::Clock;
use basekit_idempotency::{
    CachedResponse, IdempotencyError, IdempotencyKey, IdempotencyRecord, InMemoryResponseStore,
    InsertOutcome, ResponseStore, Result,
};
use chrono::{DateTime, TimeDelta, Utc};

/// Store wrapper that can be told to fail individual operations.
#[derive(Clone, Default)]
pub struct FlakyStore {
    inner: InMemoryResponseStore,
    fail_fetch: Arc<AtomicBool>,
    fail_insert: Arc<AtomicBool>,
    purge_failures_left: Arc<AtomicU32>,
    fetch_calls: Arc<AtomicU32>,
    insert_calls: Arc<AtomicU32>,
    purge_calls: Arc<AtomicU32>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &InMemoryResponseStore {
        &self.inner
    }

    pub fn fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_insert(&self, fail: bool) {
        self.fail_insert.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_purges(&self, count: u32) {
        self.purge_failures_left.store(count, Ordering::SeqCst);
    }

    pub fn fetch_calls(&self) -> u32 {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn insert_calls(&self) -> u32 {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn purge_calls(&self) -> u32 {
        self.purge_calls.load(Ordering::SeqCst)
    }
}

fn outage(operation: &str) -> IdempotencyError {
    IdempotencyError::Storage {
        backend: "flaky",
        reason: format!("{operation}: connection refused"),
    }
}

#[async_trait]
impl ResponseStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn fetch(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(outage("fetch"));
        }
        self.inner.fetch(key).await
    }

    async fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<InsertOutcome> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(outage("insert"));
        }
        self.inner.insert_if_absent(record).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        self.purge_calls.fetch_add(1, Ordering::SeqCst);
        let left = self.purge_failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.purge_failures_left.store(left - 1, Ordering::SeqCst);
            return Err(outage("purge"));
        }
        self.inner.purge_expired(now).await
    }
}

/// Clock whose time only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Utc::now())),
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        *self.now.lock().unwrap() += TimeDelta::seconds(secs);
    }

    pub fn clock(&self) -> Clock {
        let now = Arc::clone(&self.now);
        Arc::new(move || *now.lock().unwrap())
    }
}

/// Counts how many times an operation body actually ran.
#[derive(Clone, Default)]
pub struct CallCounter(Arc<AtomicU32>);

impl CallCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hit(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    pub fn count(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }
}

/// An operation returning `response` and bumping `counter`.
pub fn respond(
    counter: &CallCounter,
    response: CachedResponse,
) -> impl FnOnce() -> std::future::Ready<anyhow::Result<CachedResponse>> {
    let counter = counter.clone();
    move || {
        counter.hit();
        std::future::ready(Ok(response))
    }
}
