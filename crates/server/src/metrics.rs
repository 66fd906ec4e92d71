//! Prometheus metrics for the upload server.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape it.
//! Metrics carry no owner, file or session identifiers, only aggregate
//! counts, but the endpoint should still be network-restricted to the
//! scraper at the infrastructure level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload session metrics
pub static UPLOAD_SESSIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "filevault_upload_sessions_created_total",
        "Total number of upload sessions created",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "filevault_upload_sessions_completed_total",
        "Total number of upload sessions stored and recorded",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "filevault_upload_sessions_failed_total",
        "Total number of upload sessions torn down after a failure",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_EXPIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "filevault_upload_sessions_expired_total",
        "Total number of upload sessions that expired",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_SESSIONS_ABORTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "filevault_upload_sessions_aborted_total",
        "Total number of upload sessions aborted by the client",
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "filevault_chunks_received_total",
        "Total number of chunks written to scratch",
    )
    .expect("metric creation failed")
});

pub static CHUNK_RESENDS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "filevault_chunk_resends_total",
        "Total number of chunks received for an index already present",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "filevault_bytes_received_total",
        "Total chunk bytes written to scratch",
    )
    .expect("metric creation failed")
});

pub static OBJECTS_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "filevault_objects_stored_total",
        "Total number of object versions written to the object store",
    )
    .expect("metric creation failed")
});

// Timing metrics
pub static REASSEMBLY_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "filevault_reassembly_duration_seconds",
            "Time taken to merge chunks and store the result",
        )
        .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
    )
    .expect("metric creation failed")
});

pub static CHUNK_RECEIVE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "filevault_chunk_receive_duration_seconds",
            "Time taken to accept a single chunk",
        )
        .buckets(vec![0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
    )
    .expect("metric creation failed")
});

// Error metrics
pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "filevault_upload_errors_total",
            "Total upload errors by error type",
        ),
        &["error_type"],
    )
    .expect("metric creation failed")
});

// Current state gauges
pub static ACTIVE_UPLOAD_SESSIONS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "filevault_active_upload_sessions",
        "Current number of live upload sessions",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOAD_SESSIONS_CREATED.clone()),
            Box::new(UPLOAD_SESSIONS_COMPLETED.clone()),
            Box::new(UPLOAD_SESSIONS_FAILED.clone()),
            Box::new(UPLOAD_SESSIONS_EXPIRED.clone()),
            Box::new(UPLOAD_SESSIONS_ABORTED.clone()),
            Box::new(CHUNKS_RECEIVED.clone()),
            Box::new(CHUNK_RESENDS.clone()),
            Box::new(BYTES_RECEIVED.clone()),
            Box::new(OBJECTS_STORED.clone()),
            Box::new(REASSEMBLY_DURATION.clone()),
            Box::new(CHUNK_RECEIVE_DURATION.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
            Box::new(ACTIVE_UPLOAD_SESSIONS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "Failed to register metric");
            }
        }
    });
}

/// Handler for GET /metrics.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", encoder.format_type().to_string())],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain".to_string())],
                b"failed to encode metrics".to_vec(),
            )
        }
    }
}

/// Record an upload error by type.
pub fn record_upload_error(error_type: &str) {
    UPLOAD_ERRORS.with_label_values(&[error_type]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_metrics_is_idempotent() {
        register_metrics();
        register_metrics();
        UPLOAD_SESSIONS_CREATED.inc();
        let families = REGISTRY.gather();
        assert!(
            families
                .iter()
                .any(|f| f.get_name() == "filevault_upload_sessions_created_total")
        );
    }

    #[test]
    fn test_record_upload_error_labels() {
        let before = UPLOAD_ERRORS.with_label_values(&["io_failure"]).get();
        record_upload_error("io_failure");
        assert_eq!(
            UPLOAD_ERRORS.with_label_values(&["io_failure"]).get(),
            before + 1
        );
    }
}
