use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IdempotencyError, Result};
use crate::key::IdempotencyKey;
use crate::response::CachedResponse;

/// A stored outcome for one idempotency key. Never mutated once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub response: CachedResponse,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(
        key: IdempotencyKey,
        response: CachedResponse,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|delta| now.checked_add_signed(delta))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            key,
            response,
            created_at: now,
            expires_at,
        }
    }

    /// A record is usable strictly before `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Result of an insert-if-absent write.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The record was written.
    Inserted,
    /// An unexpired record already held the key; it was left untouched.
    Existing(IdempotencyRecord),
}

/// Persistence port for idempotency records.
#[async_trait]
pub trait ResponseStore: Send + Sync {
    /// Short backend name used in logs and errors.
    fn backend(&self) -> &'static str;

    /// Returns the record for `key`, expired or not.
    async fn fetch(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;

    /// Atomically inserts `record` unless an unexpired record holds the key.
    ///
    /// Expiry of an existing record is judged against `record.created_at`;
    /// an expired record is replaced.
    async fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<InsertOutcome>;

    /// Deletes records expired at `now`, returning how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// In-memory store used by default and in tests.
#[derive(Debug, Default, Clone)]
pub struct InMemoryResponseStore {
    records: Arc<Mutex<HashMap<String, IdempotencyRecord>>>,
}

impl InMemoryResponseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, IdempotencyRecord>>> {
        self.records
            .lock()
            .map_err(|_| IdempotencyError::storage("memory", "record map lock poisoned"))
    }
}

#[async_trait]
impl ResponseStore for InMemoryResponseStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn fetch(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        Ok(self.lock()?.get(key.as_str()).cloned())
    }

    async fn insert_if_absent(&self, record: IdempotencyRecord) -> Result<InsertOutcome> {
        let mut guard = self.lock()?;
        if let Some(existing) = guard.get(record.key.as_str())
            && !existing.is_expired_at(record.created_at)
        {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        guard.insert(record.key.as_str().to_string(), record);
        Ok(InsertOutcome::Inserted)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut guard = self.lock()?;
        let before = guard.len();
        guard.retain(|_, record| !record.is_expired_at(now));
        Ok((before - guard.len()) as u64)
    }
}
