use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{Instrument, info_span};

use crate::cache::{Clock, DEFAULT_TTL, ResponseCache, StoreOutcome};
use crate::config::IdempotencyConfig;
use crate::error::{IdempotencyError, Result};
use crate::key::{HeaderLookup, IdempotencyKey, KeyDeriver, operation_prefix};
use crate::metrics::IdempotencyMetrics;
use crate::response::CachedResponse;
use crate::store::{InMemoryResponseStore, ResponseStore};

/// Which non-success responses returned by an operation get cached.
///
/// Responses with status below 400 are always cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCaching {
    /// Only success and redirect responses are cached.
    #[default]
    Never,
    /// 4xx responses are cached as well; 5xx are retried.
    ClientErrors,
    /// Every response is cached, including 5xx.
    Always,
}

impl ErrorCaching {
    pub fn should_cache(self, response: &CachedResponse) -> bool {
        match self {
            Self::Never => response.is_success(),
            Self::ClientErrors => !response.is_server_error(),
            Self::Always => true,
        }
    }
}

/// Per-call overrides for [`IdempotencyExecutor::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub ttl: Option<Duration>,
    pub error_caching: Option<ErrorCaching>,
}

impl ExecuteOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn error_caching(mut self, policy: ErrorCaching) -> Self {
        self.error_caching = Some(policy);
        self
    }
}

/// Result of an idempotent execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub response: CachedResponse,
    pub idempotency_key: IdempotencyKey,
    /// True when the response came from the cache and the operation did not run.
    pub replayed: bool,
    /// What happened to the cache write; `None` for replays and uncached responses.
    pub store_outcome: Option<StoreOutcome>,
}

impl Execution {
    /// Response headers with the key suffix echoed in `header_name`.
    pub fn response_headers(&self, header_name: &str) -> BTreeMap<String, String> {
        let mut headers = self.response.headers.clone();
        headers.insert(
            header_name.to_string(),
            self.idempotency_key.suffix().to_string(),
        );
        headers
    }

    /// Consumes the execution, returning the response with the key echoed.
    pub fn into_response(self, header_name: &str) -> CachedResponse {
        let headers = self.response_headers(header_name);
        CachedResponse { headers, ..self.response }
    }
}

/// Check, execute, store: replays cached responses for repeated keys.
#[derive(Clone)]
pub struct IdempotencyExecutor {
    cache: ResponseCache,
    deriver: KeyDeriver,
    error_caching: ErrorCaching,
    operation_ttls: Arc<HashMap<String, Duration>>,
}

impl IdempotencyExecutor {
    pub fn new(cache: ResponseCache) -> Self {
        Self {
            cache,
            deriver: KeyDeriver::default(),
            error_caching: ErrorCaching::default(),
            operation_ttls: Arc::new(HashMap::new()),
        }
    }

    pub fn builder() -> IdempotencyExecutorBuilder {
        IdempotencyExecutorBuilder::new()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    pub fn metrics(&self) -> &IdempotencyMetrics {
        self.cache.metrics()
    }

    /// TTL for `prefix`: the configured per-operation value or the cache default.
    pub fn ttl_for(&self, prefix: &str) -> Duration {
        self.operation_ttls
            .get(operation_prefix(prefix).as_ref())
            .copied()
            .unwrap_or_else(|| self.cache.default_ttl())
    }

    /// Runs `operation` unless `key` already has an unexpired cached response.
    ///
    /// Errors from `operation` are returned unchanged and nothing is cached.
    /// A zero TTL disables caching for the call.
    /// Concurrent first calls with one key may all run; only the first write
    /// is kept, but each caller receives its own response.
    pub async fn execute<F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        operation: F,
        options: ExecuteOptions,
    ) -> std::result::Result<Execution, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<CachedResponse, E>>,
        E: From<IdempotencyError>,
    {
        let span = info_span!(
            "idempotency.execute",
            operation = %key.prefix(),
            replayed = tracing::field::Empty,
        );
        self.run(key, operation, options).instrument(span).await
    }

    async fn run<F, Fut, E>(
        &self,
        key: &IdempotencyKey,
        operation: F,
        options: ExecuteOptions,
    ) -> std::result::Result<Execution, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<CachedResponse, E>>,
        E: From<IdempotencyError>,
    {
        let lookup = self.cache.lookup(key).await.map_err(E::from)?;
        if let Some(response) = lookup.cached_response {
            tracing::Span::current().record("replayed", true);
            tracing::info!(key = %key, status = response.status, "replaying cached response");
            return Ok(Execution {
                response,
                idempotency_key: key.clone(),
                replayed: true,
                store_outcome: None,
            });
        }
        tracing::Span::current().record("replayed", false);

        let started = Instant::now();
        let response = operation().await?;
        self.cache.metrics().record_operation(key.prefix(), started.elapsed());

        let policy = options.error_caching.unwrap_or(self.error_caching);
        let ttl = options.ttl.unwrap_or_else(|| self.ttl_for(key.prefix()));
        let store_outcome = if ttl.is_zero() {
            tracing::debug!(key = %key, "zero ttl, response not cached");
            None
        } else if policy.should_cache(&response) {
            Some(self.cache.store(key, &response, Some(ttl)).await)
        } else {
            tracing::debug!(
                key = %key,
                status = response.status,
                "response not cacheable under current policy"
            );
            None
        };

        Ok(Execution {
            response,
            idempotency_key: key.clone(),
            replayed: false,
            store_outcome,
        })
    }

    /// Derives the key from request headers, then calls [`Self::execute`].
    pub async fn execute_request<H, F, Fut, E>(
        &self,
        prefix: &str,
        headers: &H,
        fallback: Option<&str>,
        operation: F,
        options: ExecuteOptions,
    ) -> std::result::Result<Execution, E>
    where
        H: HeaderLookup + ?Sized,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<CachedResponse, E>>,
        E: From<IdempotencyError>,
    {
        let key = self
            .deriver
            .derive_checked(prefix, headers, fallback)
            .map_err(|issue| E::from(IdempotencyError::InvalidKey(issue)))?;
        self.execute(&key, operation, options).await
    }
}

impl Default for IdempotencyExecutor {
    fn default() -> Self {
        Self::new(ResponseCache::default())
    }
}

/// Builder for configuring an executor instance.
pub struct IdempotencyExecutorBuilder {
    store: Arc<dyn ResponseStore>,
    fail_open: bool,
    default_ttl: Duration,
    error_caching: ErrorCaching,
    operation_ttls: HashMap<String, Duration>,
    deriver: KeyDeriver,
    clock: Option<Clock>,
    metrics: IdempotencyMetrics,
}

impl Default for IdempotencyExecutorBuilder {
    fn default() -> Self {
        Self {
            store: Arc::new(InMemoryResponseStore::new()),
            fail_open: true,
            default_ttl: DEFAULT_TTL,
            error_caching: ErrorCaching::default(),
            operation_ttls: HashMap::new(),
            deriver: KeyDeriver::default(),
            clock: None,
            metrics: IdempotencyMetrics::new(),
        }
    }
}

impl IdempotencyExecutorBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a validated config, opening the configured store.
    pub fn from_config(config: &IdempotencyConfig) -> Result<Self> {
        config.validate()?;
        let mut builder = Self::new()
            .with_store(config.store.open()?)
            .with_fail_open(config.fail_open)
            .with_default_ttl(Duration::from_secs(config.default_ttl_secs))
            .with_error_caching(config.error_caching)
            .with_header_name(config.header_name.clone());
        for (prefix, secs) in &config.operations {
            builder = builder.with_operation_ttl(prefix.clone(), Duration::from_secs(*secs));
        }
        Ok(builder)
    }

    pub fn with_store(mut self, store: Arc<dyn ResponseStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn with_error_caching(mut self, policy: ErrorCaching) -> Self {
        self.error_caching = policy;
        self
    }

    pub fn with_operation_ttl(mut self, prefix: impl Into<String>, ttl: Duration) -> Self {
        let prefix = prefix.into();
        self.operation_ttls
            .insert(operation_prefix(&prefix).into_owned(), ttl);
        self
    }

    pub fn with_header_name(mut self, name: impl Into<String>) -> Self {
        self.deriver = self.deriver.with_header_name(name);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_metrics(mut self, metrics: IdempotencyMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build(self) -> IdempotencyExecutor {
        let mut cache = ResponseCache::new(self.store)
            .with_fail_open(self.fail_open)
            .with_default_ttl(self.default_ttl)
            .with_metrics(self.metrics);
        if let Some(clock) = self.clock {
            cache = cache.with_clock(clock);
        }
        IdempotencyExecutor {
            cache,
            deriver: self.deriver,
            error_caching: self.error_caching,
            operation_ttls: Arc::new(self.operation_ttls),
        }
    }
}
