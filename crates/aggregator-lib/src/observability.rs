//! Self-observability for the aggregation service
//!
//! Prometheus counters and gauges covering the pipeline's backpressure and
//! delivery behavior. Queue overflow is never surfaced to callers as an
//! error, so these counters are the only record of dropped data.

use prometheus::{register_int_counter, register_int_gauge, IntCounter, IntGauge};
use std::sync::OnceLock;

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<ServiceMetricsInner> = OnceLock::new();

struct ServiceMetricsInner {
    samples_submitted: IntCounter,
    samples_dropped: IntCounter,
    metrics_emitted: IntCounter,
    emissions_dropped: IntCounter,
    buckets_flushed: IntCounter,
    active_buckets: IntGauge,
    remote_write_dropped: IntCounter,
    remote_write_batches: IntCounter,
    remote_write_failures: IntCounter,
}

impl ServiceMetricsInner {
    fn new() -> Self {
        Self {
            samples_submitted: register_int_counter!(
                "aggregator_samples_submitted_total",
                "Samples accepted onto the aggregation input queue"
            )
            .expect("Failed to register samples_submitted"),

            samples_dropped: register_int_counter!(
                "aggregator_samples_dropped_total",
                "Samples dropped because the input queue was full"
            )
            .expect("Failed to register samples_dropped"),

            metrics_emitted: register_int_counter!(
                "aggregator_metrics_emitted_total",
                "Aggregated metrics emitted by the flusher"
            )
            .expect("Failed to register metrics_emitted"),

            emissions_dropped: register_int_counter!(
                "aggregator_emissions_dropped_total",
                "Aggregated metrics dropped because the output stream was full"
            )
            .expect("Failed to register emissions_dropped"),

            buckets_flushed: register_int_counter!(
                "aggregator_buckets_flushed_total",
                "Aggregation buckets flushed"
            )
            .expect("Failed to register buckets_flushed"),

            active_buckets: register_int_gauge!(
                "aggregator_active_buckets",
                "Aggregation buckets currently accumulating samples"
            )
            .expect("Failed to register active_buckets"),

            remote_write_dropped: register_int_counter!(
                "aggregator_remote_write_dropped_total",
                "Metrics dropped because the remote-write queue was full"
            )
            .expect("Failed to register remote_write_dropped"),

            remote_write_batches: register_int_counter!(
                "aggregator_remote_write_batches_total",
                "Remote-write batches shipped"
            )
            .expect("Failed to register remote_write_batches"),

            remote_write_failures: register_int_counter!(
                "aggregator_remote_write_failures_total",
                "Remote-write sends that exhausted their retries"
            )
            .expect("Failed to register remote_write_failures"),
        }
    }
}

/// Lightweight handle to the global service metrics.
///
/// Clones share the same underlying registry entries.
#[derive(Clone)]
pub struct ServiceMetrics {
    _private: (),
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ServiceMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ServiceMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_samples_submitted(&self) {
        self.inner().samples_submitted.inc();
    }

    pub fn inc_samples_dropped(&self) {
        self.inner().samples_dropped.inc();
    }

    pub fn inc_metrics_emitted(&self) {
        self.inner().metrics_emitted.inc();
    }

    pub fn inc_emissions_dropped(&self) {
        self.inner().emissions_dropped.inc();
    }

    pub fn inc_buckets_flushed(&self) {
        self.inner().buckets_flushed.inc();
    }

    pub fn set_active_buckets(&self, count: i64) {
        self.inner().active_buckets.set(count);
    }

    pub fn inc_remote_write_dropped(&self) {
        self.inner().remote_write_dropped.inc();
    }

    pub fn inc_remote_write_batches(&self) {
        self.inner().remote_write_batches.inc();
    }

    pub fn inc_remote_write_failures(&self) {
        self.inner().remote_write_failures.inc();
    }
}
