//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define proxy metrics (sessions, connect attempts, rejections, frames)
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `grip_proxy_sessions_total` (counter): sessions started
//! - `grip_proxy_sessions_active` (gauge): sessions not yet finished
//! - `grip_proxy_connect_attempts_total` (counter): outbound attempts by result
//! - `grip_proxy_rejections_total` (counter): refused upgrades by code
//! - `grip_proxy_frames_relayed_total` (counter): relayed frames by direction
//! - `grip_proxy_control_messages_total` (counter): messages sent to the broker
//!
//! # Design Decisions
//! - Without an installed recorder every call is a no-op
//! - Labels are static strings or status codes only

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

pub const SESSIONS_TOTAL: &str = "grip_proxy_sessions_total";
pub const SESSIONS_ACTIVE: &str = "grip_proxy_sessions_active";
pub const CONNECT_ATTEMPTS_TOTAL: &str = "grip_proxy_connect_attempts_total";
pub const REJECTIONS_TOTAL: &str = "grip_proxy_rejections_total";
pub const FRAMES_RELAYED_TOTAL: &str = "grip_proxy_frames_relayed_total";
pub const CONTROL_MESSAGES_TOTAL: &str = "grip_proxy_control_messages_total";

/// Install the Prometheus recorder and its scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_session_started() {
    counter!(SESSIONS_TOTAL).increment(1);
    gauge!(SESSIONS_ACTIVE).increment(1.0);
}

pub fn record_session_finished() {
    gauge!(SESSIONS_ACTIVE).decrement(1.0);
}

/// `result` is one of `connected`, `connect_failed`, `connect_timeout`,
/// `tls_failed`, `rejected` or `error`.
pub fn record_connect_attempt(result: &'static str) {
    counter!(CONNECT_ATTEMPTS_TOTAL, "result" => result).increment(1);
}

pub fn record_rejection(status: u16) {
    counter!(REJECTIONS_TOTAL, "code" => status.to_string()).increment(1);
}

/// `direction` is `to_client` or `to_backend`.
pub fn record_frames_relayed(direction: &'static str, count: usize) {
    counter!(FRAMES_RELAYED_TOTAL, "direction" => direction).increment(count as u64);
}

pub fn record_control_message() {
    counter!(CONTROL_MESSAGES_TOTAL).increment(1);
}
