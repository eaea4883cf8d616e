use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Global metrics instance.
pub static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Metrics collector for idempotency coordination.
///
/// Without an installed recorder every call is a no-op, so library users that
/// never call [`init_metrics`] pay nothing.
#[derive(Debug, Clone)]
pub struct Metrics {
    initialized: bool,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self { initialized: true }
    }

    /// `outcome` is one of `claimed`, `duplicate`, `bypassed`, `rejected`, `invalid`.
    pub fn record_claim(&self, backend: &str, namespace: &str, outcome: &str) {
        counter!("idempotency_claims_total", "backend" => backend.to_string(), "namespace" => namespace.to_string(), "outcome" => outcome.to_string()).increment(1);
    }

    pub fn record_work_completed(&self, backend: &str, namespace: &str, duration_ms: f64) {
        counter!("idempotency_work_completed_total", "backend" => backend.to_string(), "namespace" => namespace.to_string()).increment(1);
        histogram!("idempotency_work_duration_ms", "namespace" => namespace.to_string()).record(duration_ms);
    }

    pub fn record_work_failed(&self, backend: &str, namespace: &str) {
        counter!("idempotency_work_failed_total", "backend" => backend.to_string(), "namespace" => namespace.to_string()).increment(1);
    }

    pub fn record_store_operation(&self, backend: &str, operation: &str, duration_ms: f64, success: bool) {
        counter!("idempotency_store_operations_total", "backend" => backend.to_string(), "operation" => operation.to_string(), "success" => success.to_string()).increment(1);
        histogram!("idempotency_store_duration_ms", "backend" => backend.to_string(), "operation" => operation.to_string()).record(duration_ms);
    }

    pub fn record_sweep(&self, backend: &str, removed: u64) {
        counter!("idempotency_sweep_removed_total", "backend" => backend.to_string()).increment(removed);
    }
}

/// Timer for measuring operation latency.
pub struct LatencyTimer {
    start: Instant,
}

impl LatencyTimer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

impl Default for LatencyTimer {
    fn default() -> Self {
        Self::new()
    }
}

/// Initializes the metrics system and returns the Prometheus handle.
pub fn init_metrics() -> PrometheusHandle {
    let handle = METRICS_HANDLE.get_or_init(|| {
        let builder = PrometheusBuilder::new();
        let handle = builder
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        describe_metrics();
        handle
    });

    METRICS.get_or_init(Metrics::new);

    handle.clone()
}

/// Describes all metrics for Prometheus.
fn describe_metrics() {
    describe_counter!("idempotency_claims_total", Unit::Count, "Claim attempts by outcome");
    describe_counter!("idempotency_work_completed_total", Unit::Count, "Protected work that completed successfully");
    describe_counter!("idempotency_work_failed_total", Unit::Count, "Protected work that returned an error");
    describe_histogram!("idempotency_work_duration_ms", Unit::Milliseconds, "Protected work latency in milliseconds");

    describe_counter!("idempotency_store_operations_total", Unit::Count, "Storage backend operations");
    describe_histogram!("idempotency_store_duration_ms", Unit::Milliseconds, "Storage backend latency in milliseconds");

    describe_counter!("idempotency_sweep_removed_total", Unit::Count, "Expired claims removed by the sweep");
}

/// Returns the global metrics instance.
pub fn get_metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}
