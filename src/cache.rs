use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::key::IdempotencyKey;
use crate::metrics::IdempotencyMetrics;
use crate::response::CachedResponse;
use crate::store::{IdempotencyRecord, InMemoryResponseStore, InsertOutcome, ResponseStore};

/// Source of the current time, injectable for expiry tests.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// TTL applied when the caller does not pick one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3_600);
/// TTL used for key rotation.
pub const ROTATE_TTL: Duration = Duration::from_secs(300);
/// TTL used for key revocation, effectively permanent.
pub const REVOKE_TTL: Duration = Duration::from_secs(31_536_000);

/// Outcome of a cache lookup.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LookupResult {
    pub is_duplicate: bool,
    pub cached_response: Option<CachedResponse>,
}

impl LookupResult {
    pub fn miss() -> Self {
        Self::default()
    }

    pub fn hit(response: CachedResponse) -> Self {
        Self {
            is_duplicate: true,
            cached_response: Some(response),
        }
    }
}

/// Outcome of a cache write. Write failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOutcome {
    Stored,
    /// Another writer stored first; its response stays cached.
    AlreadyPresent(CachedResponse),
    Failed,
}

/// Key → response cache with expiry over a [`ResponseStore`].
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn ResponseStore>,
    fail_open: bool,
    default_ttl: Duration,
    clock: Clock,
    metrics: IdempotencyMetrics,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryResponseStore::new()))
    }
}

impl ResponseCache {
    pub fn new(store: Arc<dyn ResponseStore>) -> Self {
        Self {
            store,
            fail_open: true,
            default_ttl: DEFAULT_TTL,
            clock: system_clock(),
            metrics: IdempotencyMetrics::new(),
        }
    }

    /// When true (the default) a failed lookup reads as a miss.
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: IdempotencyMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub fn metrics(&self) -> &IdempotencyMetrics {
        &self.metrics
    }

    pub fn backing_store(&self) -> &Arc<dyn ResponseStore> {
        &self.store
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    /// Returns the unexpired response cached under `key`, if any.
    ///
    /// Storage errors become a miss under fail-open and are returned otherwise.
    pub async fn lookup(&self, key: &IdempotencyKey) -> Result<LookupResult> {
        match self.store.fetch(key).await {
            Ok(Some(record)) if !record.is_expired_at(self.now()) => {
                self.metrics.record_hit(key.prefix());
                Ok(LookupResult::hit(record.response))
            }
            Ok(_) => {
                self.metrics.record_miss(key.prefix());
                Ok(LookupResult::miss())
            }
            Err(err) => {
                self.metrics.record_lookup_failure(key.prefix());
                if self.fail_open {
                    tracing::warn!(
                        key = %key,
                        backend = self.store.backend(),
                        error = %err,
                        "idempotency lookup failed, treating as miss"
                    );
                    Ok(LookupResult::miss())
                } else {
                    tracing::error!(
                        key = %key,
                        backend = self.store.backend(),
                        error = %err,
                        "idempotency lookup failed"
                    );
                    Err(err)
                }
            }
        }
    }

    /// Caches `response` under `key` for `ttl` (or the default TTL).
    /// The first writer wins; later writes leave the stored record alone.
    pub async fn store(
        &self,
        key: &IdempotencyKey,
        response: &CachedResponse,
        ttl: Option<Duration>,
    ) -> StoreOutcome {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let record = IdempotencyRecord::new(key.clone(), response.clone(), self.now(), ttl);
        match self.store.insert_if_absent(record).await {
            Ok(InsertOutcome::Inserted) => {
                self.metrics.record_stored(key.prefix());
                tracing::debug!(key = %key, ttl_secs = ttl.as_secs(), "cached idempotent response");
                StoreOutcome::Stored
            }
            Ok(InsertOutcome::Existing(existing)) => {
                self.metrics.record_store_conflict(key.prefix());
                tracing::debug!(key = %key, "idempotency key already cached by another writer");
                StoreOutcome::AlreadyPresent(existing.response)
            }
            Err(err) => {
                self.metrics.record_store_failure(key.prefix());
                tracing::warn!(
                    key = %key,
                    backend = self.store.backend(),
                    error = %err,
                    "failed to cache idempotent response"
                );
                StoreOutcome::Failed
            }
        }
    }

    /// Deletes expired records from the backing store.
    pub async fn purge_expired(&self) -> Result<u64> {
        let removed = self.store.purge_expired(self.now()).await?;
        self.metrics.record_purged(removed);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use serde_json::json;
    use std::sync::Mutex;

    fn manual_clock() -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(Utc::now()));
        let handle = Arc::clone(&now);
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        (clock, now)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let cache = ResponseCache::default();
        let key = IdempotencyKey::new("rotate", "a");
        assert_eq!(cache.lookup(&key).await.unwrap(), LookupResult::miss());

        let response = CachedResponse::ok(json!({"rotated": true}));
        assert_eq!(cache.store(&key, &response, None).await, StoreOutcome::Stored);
        assert_eq!(
            cache.lookup(&key).await.unwrap(),
            LookupResult::hit(response)
        );
        assert_eq!(cache.metrics().hits(), 1);
        assert_eq!(cache.metrics().misses(), 1);
    }

    #[tokio::test]
    async fn record_expires_after_ttl() {
        let (clock, now) = manual_clock();
        let cache = ResponseCache::default().with_clock(clock);
        let key = IdempotencyKey::new("rotate", "a");
        cache
            .store(&key, &CachedResponse::ok(json!(1)), Some(ROTATE_TTL))
            .await;

        *now.lock().unwrap() += TimeDelta::seconds(299);
        assert!(cache.lookup(&key).await.unwrap().is_duplicate);

        *now.lock().unwrap() += TimeDelta::seconds(1);
        assert!(!cache.lookup(&key).await.unwrap().is_duplicate);
    }

    #[tokio::test]
    async fn second_store_reports_existing() {
        let cache = ResponseCache::default();
        let key = IdempotencyKey::new("revoke", "k");
        let first = CachedResponse::ok(json!({"n": 1}));
        cache.store(&key, &first, Some(REVOKE_TTL)).await;
        let outcome = cache
            .store(&key, &CachedResponse::ok(json!({"n": 2})), Some(REVOKE_TTL))
            .await;
        assert_eq!(outcome, StoreOutcome::AlreadyPresent(first));
    }
}
