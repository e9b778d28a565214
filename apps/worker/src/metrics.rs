//! Metrics collection for the bulk worker
//!
//! Prometheus metrics for claim, heartbeat and completion traffic against the
//! work queue, exposed by [`crate::server`] when enabled.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    /// Units claimed by this process, by partition
    pub static ref UNITS_CLAIMED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "bulk_units_claimed_total",
        "Total number of work units claimed",
        &["partition"]
    )
    .expect("Failed to register UNITS_CLAIMED_TOTAL");

    /// Dequeue calls that found nothing pending
    pub static ref DEQUEUE_EMPTY_TOTAL: IntCounter = register_int_counter!(
        "bulk_dequeue_empty_total",
        "Total number of dequeue calls that found no pending unit"
    )
    .expect("Failed to register DEQUEUE_EMPTY_TOTAL");

    /// Units completed by outcome (completed, failed)
    pub static ref UNITS_COMPLETED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "bulk_units_completed_total",
        "Total number of work units moved to a terminal status",
        &["resource_type_id", "status"]
    )
    .expect("Failed to register UNITS_COMPLETED_TOTAL");

    /// Wall time from claim to completion
    pub static ref UNIT_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "bulk_unit_duration_seconds",
        "Work unit processing duration in seconds",
        &["resource_type_id"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 3600.0]
    )
    .expect("Failed to register UNIT_DURATION_SECONDS");

    /// Payloads read for successfully completed units
    pub static ref PAYLOADS_READ_TOTAL: IntCounterVec = register_int_counter_vec!(
        "bulk_payloads_read_total",
        "Total number of resource payloads read by units that completed successfully",
        &["resource_type_id"]
    )
    .expect("Failed to register PAYLOADS_READ_TOTAL");

    /// Heartbeats by outcome (ok, lost, error)
    pub static ref HEARTBEATS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "bulk_heartbeats_total",
        "Total number of heartbeats sent",
        &["outcome"]
    )
    .expect("Failed to register HEARTBEATS_TOTAL");

    /// Store call failures by operation
    pub static ref STORE_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "bulk_store_errors_total",
        "Total number of failed work queue store calls",
        &["operation", "transient"]
    )
    .expect("Failed to register STORE_ERRORS_TOTAL");

    /// Units returned to Pending by the reaper
    pub static ref UNITS_REQUEUED_TOTAL: IntCounter = register_int_counter!(
        "bulk_units_requeued_total",
        "Total number of abandoned work units returned to pending"
    )
    .expect("Failed to register UNITS_REQUEUED_TOTAL");

    /// Units currently being processed by this process
    pub static ref UNITS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "bulk_units_in_flight",
        "Number of work units currently being processed"
    )
    .expect("Failed to register UNITS_IN_FLIGHT");
}

pub fn record_store_error(operation: &str, error: &crate::Error) {
    let transient = if error.is_transient() { "true" } else { "false" };
    STORE_ERRORS_TOTAL
        .with_label_values(&[operation, transient])
        .inc();
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
