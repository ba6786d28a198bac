//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Operations submitted, confirmed and failed per protocol
//! - Submission retries and nonce resyncs
//! - Gas estimation fallbacks
//! - Submit-to-confirm latency
//!
//! Serving the text exposition is left to the embedding process.

use crate::error::ErrorKind;
use crate::operation::{OperationKind, Protocol};

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref OPERATIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "flare_agent_operations_submitted_total",
        "Total operations accepted by the network",
        &["protocol", "kind"]
    ).unwrap();

    pub static ref OPERATIONS_CONFIRMED: CounterVec = register_counter_vec!(
        "flare_agent_operations_confirmed_total",
        "Total operations confirmed on-chain",
        &["protocol", "kind"]
    ).unwrap();

    pub static ref OPERATIONS_FAILED: CounterVec = register_counter_vec!(
        "flare_agent_operations_failed_total",
        "Total operations ending in a terminal error",
        &["protocol", "error_kind"]
    ).unwrap();

    pub static ref SUBMIT_RETRIES: CounterVec = register_counter_vec!(
        "flare_agent_submit_retries_total",
        "Total retries of transient failures",
        &["stage"]
    ).unwrap();

    pub static ref NONCE_RESYNCS: CounterVec = register_counter_vec!(
        "flare_agent_nonce_resyncs_total",
        "Total nonce resyncs against the network",
        &[]
    ).unwrap();

    pub static ref GAS_FALLBACKS: CounterVec = register_counter_vec!(
        "flare_agent_gas_fallbacks_total",
        "Total gas limits taken from the static fallback policy",
        &["kind"]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "flare_agent_confirmation_latency_seconds",
        "Latency from submission to confirmation",
        &["protocol"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();
}

/// Text exposition of every registered metric
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

// Helper functions to record metrics

pub fn record_submitted(protocol: Protocol, kind: OperationKind) {
    OPERATIONS_SUBMITTED
        .with_label_values(&[protocol.name(), kind.name()])
        .inc();
}

pub fn record_confirmed(protocol: Protocol, kind: OperationKind, latency_secs: f64) {
    OPERATIONS_CONFIRMED
        .with_label_values(&[protocol.name(), kind.name()])
        .inc();
    CONFIRMATION_LATENCY
        .with_label_values(&[protocol.name()])
        .observe(latency_secs);
}

pub fn record_failed(protocol: Protocol, kind: &ErrorKind) {
    OPERATIONS_FAILED
        .with_label_values(&[protocol.name(), kind.name()])
        .inc();
}

pub fn record_retry(stage: &str) {
    SUBMIT_RETRIES.with_label_values(&[stage]).inc();
}

pub fn record_nonce_resync() {
    NONCE_RESYNCS.with_label_values(&[]).inc();
}

pub fn record_gas_fallback(kind: OperationKind) {
    GAS_FALLBACKS.with_label_values(&[kind.name()]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_exports_recorded_metrics() {
        record_submitted(Protocol::Sceptre, OperationKind::TransferAndLock);
        record_failed(Protocol::Kinetic, &ErrorKind::configuration("missing approval"));
        let text = gather();
        assert!(text.contains("flare_agent_operations_submitted_total"));
        assert!(text.contains("error_kind=\"configuration\""));
    }
}
