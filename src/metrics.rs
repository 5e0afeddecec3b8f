use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::metrics::{Counter as OtelCounter, Histogram as OtelHistogram};

/// Counters recorded by the idempotency layer. Atomics back tests and the
/// CLI; OpenTelemetry instruments feed whatever exporter the host installs.
#[derive(Clone)]
pub struct IdempotencyMetrics {
    pub hits_total: Arc<AtomicU64>,
    pub misses_total: Arc<AtomicU64>,
    pub stored_total: Arc<AtomicU64>,
    pub store_conflicts_total: Arc<AtomicU64>,
    pub store_failures_total: Arc<AtomicU64>,
    pub lookup_failures_total: Arc<AtomicU64>,
    pub purged_total: Arc<AtomicU64>,
    operation_latency: OtelHistogram<f64>,
    hits_counter: OtelCounter<u64>,
    misses_counter: OtelCounter<u64>,
    stored_counter: OtelCounter<u64>,
    store_conflicts_counter: OtelCounter<u64>,
    store_failures_counter: OtelCounter<u64>,
    lookup_failures_counter: OtelCounter<u64>,
    purged_counter: OtelCounter<u64>,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        let meter = global::meter("basekit-idempotency");
        Self {
            hits_total: Arc::new(AtomicU64::new(0)),
            misses_total: Arc::new(AtomicU64::new(0)),
            stored_total: Arc::new(AtomicU64::new(0)),
            store_conflicts_total: Arc::new(AtomicU64::new(0)),
            store_failures_total: Arc::new(AtomicU64::new(0)),
            lookup_failures_total: Arc::new(AtomicU64::new(0)),
            purged_total: Arc::new(AtomicU64::new(0)),
            operation_latency: meter
                .f64_histogram("idempotency_operation_latency_ms")
                .build(),
            hits_counter: meter.u64_counter("idempotency_hits_total").build(),
            misses_counter: meter.u64_counter("idempotency_misses_total").build(),
            stored_counter: meter.u64_counter("idempotency_stored_total").build(),
            store_conflicts_counter: meter
                .u64_counter("idempotency_store_conflicts_total")
                .build(),
            store_failures_counter: meter
                .u64_counter("idempotency_store_failures_total")
                .build(),
            lookup_failures_counter: meter
                .u64_counter("idempotency_lookup_failures_total")
                .build(),
            purged_counter: meter.u64_counter("idempotency_purged_total").build(),
        }
    }

    pub fn record_hit(&self, prefix: &str) {
        self.hits_total.fetch_add(1, Ordering::Relaxed);
        self.hits_counter.add(1, &[operation(prefix)]);
    }

    pub fn record_miss(&self, prefix: &str) {
        self.misses_total.fetch_add(1, Ordering::Relaxed);
        self.misses_counter.add(1, &[operation(prefix)]);
    }

    pub fn record_stored(&self, prefix: &str) {
        self.stored_total.fetch_add(1, Ordering::Relaxed);
        self.stored_counter.add(1, &[operation(prefix)]);
    }

    pub fn record_store_conflict(&self, prefix: &str) {
        self.store_conflicts_total.fetch_add(1, Ordering::Relaxed);
        self.store_conflicts_counter.add(1, &[operation(prefix)]);
    }

    pub fn record_store_failure(&self, prefix: &str) {
        self.store_failures_total.fetch_add(1, Ordering::Relaxed);
        self.store_failures_counter.add(1, &[operation(prefix)]);
    }

    pub fn record_lookup_failure(&self, prefix: &str) {
        self.lookup_failures_total.fetch_add(1, Ordering::Relaxed);
        self.lookup_failures_counter.add(1, &[operation(prefix)]);
    }

    pub fn record_purged(&self, removed: u64) {
        self.purged_total.fetch_add(removed, Ordering::Relaxed);
        self.purged_counter.add(removed, &[]);
    }

    pub fn record_operation(&self, prefix: &str, latency: Duration) {
        self.operation_latency
            .record(latency.as_secs_f64() * 1000.0, &[operation(prefix)]);
    }

    pub fn hits(&self) -> u64 {
        self.hits_total.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses_total.load(Ordering::Relaxed)
    }
}

impl Default for IdempotencyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn operation(prefix: &str) -> KeyValue {
    KeyValue::new("operation", prefix.to_string())
}
