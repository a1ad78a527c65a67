//! Prometheus metrics for the CCTP relayer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec,
    CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

use crate::types::MessageStatus;

lazy_static! {
    pub static ref LATEST_HEIGHT: GaugeVec = register_gauge_vec!(
        "relayer_latest_height",
        "Latest block height seen per chain",
        &["chain", "domain"]
    ).unwrap();

    pub static ref MESSAGES_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_messages_observed_total",
        "Total number of MessageSent events observed",
        &["chain"]
    ).unwrap();

    pub static ref MESSAGES_STATUS: CounterVec = register_counter_vec!(
        "relayer_messages_status_total",
        "Total number of message status transitions",
        &["status"]
    ).unwrap();

    pub static ref BROADCAST_ERRORS: CounterVec = register_counter_vec!(
        "relayer_broadcast_errors_total",
        "Total number of failed broadcast attempts",
        &["chain", "domain"]
    ).unwrap();

    pub static ref WALLET_BALANCE: GaugeVec = register_gauge_vec!(
        "relayer_wallet_balance",
        "Native balance of the minter account",
        &["chain", "address", "denom"]
    ).unwrap();

    pub static ref PROCESSING_QUEUE_DEPTH: Gauge = register_gauge!(
        "relayer_processing_queue_depth",
        "Number of transactions waiting in the processing queue"
    ).unwrap();

    pub static ref RELAY_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_relay_latency_seconds",
        "Time from first observation to a terminal status",
        &["status"],
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]
    ).unwrap();
}

pub fn set_latest_height(chain: &str, domain: u32, height: u64) {
    LATEST_HEIGHT
        .with_label_values(&[chain, &domain.to_string()])
        .set(height as f64);
}

pub fn record_message_observed(chain: &str) {
    MESSAGES_OBSERVED.with_label_values(&[chain]).inc();
}

pub fn record_status(status: MessageStatus) {
    MESSAGES_STATUS.with_label_values(&[status.as_str()]).inc();
}

pub fn record_broadcast_error(chain: &str, domain: u32) {
    BROADCAST_ERRORS
        .with_label_values(&[chain, &domain.to_string()])
        .inc();
}

pub fn set_wallet_balance(chain: &str, address: &str, denom: &str, balance: f64) {
    WALLET_BALANCE
        .with_label_values(&[chain, address, denom])
        .set(balance);
}

pub fn set_queue_depth(depth: usize) {
    PROCESSING_QUEUE_DEPTH.set(depth as f64);
}

pub fn record_relay_latency(status: MessageStatus, seconds: f64) {
    RELAY_LATENCY
        .with_label_values(&[status.as_str()])
        .observe(seconds);
}

/// Render the default registry in Prometheus text format
pub fn gather_text() -> eyre::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
