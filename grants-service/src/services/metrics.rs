//! Prometheus metrics for grant storage.

use crate::services::error::GrantError;
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec,
    TextEncoder,
};
use std::future::Future;

/// Storer operation duration by backend and operation.
pub static STORER_OPERATION_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "grants_storer_operation_duration_seconds",
        "Grant storer operation duration in seconds",
        &["backend", "operation"],
        vec![0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .expect("Failed to register storer_operation_duration")
});

/// Storer operation outcomes. `outcome` is `ok` or a [`GrantError::kind`].
pub static STORER_OPERATIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "grants_storer_operations_total",
        "Total grant storer operations by outcome",
        &["backend", "operation", "outcome"]
    )
    .expect("Failed to register storer_operations_total")
});

/// Register all metrics. Call once at startup.
pub fn init_metrics() {
    Lazy::force(&STORER_OPERATION_DURATION);
    Lazy::force(&STORER_OPERATIONS_TOTAL);
}

/// Render all registered metrics in the Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Time a storer operation, count its outcome and log failures.
///
/// A reused source is logged at `warn`: it usually means a credential was
/// replayed.
pub async fn observe_operation<T, F>(
    backend: &'static str,
    operation: &'static str,
    fut: F,
) -> Result<T, GrantError>
where
    F: Future<Output = Result<T, GrantError>>,
{
    let timer = STORER_OPERATION_DURATION
        .with_label_values(&[backend, operation])
        .start_timer();
    let result = fut.await;
    timer.observe_duration();

    let outcome = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind(),
    };
    STORER_OPERATIONS_TOTAL
        .with_label_values(&[backend, operation, outcome])
        .inc();

    match &result {
        Ok(_) => {}
        Err(GrantError::SourceAlreadyUsed) => {
            tracing::warn!(backend, operation, "Grant source reused");
        }
        Err(GrantError::Backend(e)) => {
            tracing::error!(backend, operation, error = %e, "Grant storer backend failure");
        }
        Err(e) => {
            tracing::debug!(backend, operation, outcome = e.kind(), "Grant operation rejected");
        }
    }

    result
}
