//! Metrics collection.
//!
//! # Metrics
//! - `twinport_mux_connections_total` (counter): classified connections by role
//! - `twinport_mux_dropped_total` (counter): connections closed before hand-off, by reason
//! - `twinport_mux_accept_paused_total` (counter): accept pauses caused by descriptor or memory exhaustion
//! - `twinport_shutdown_handlers_total` (counter): shutdown handler results, by outcome
//!
//! # Design Decisions
//! - Recorded through the `metrics` facade; installing an exporter is up to
//!   the embedding application
//! - Label values are static strings to keep cardinality fixed

use metrics::counter;

use crate::net::Role;

pub fn record_mux_connection(role: Role) {
    counter!("twinport_mux_connections_total", "role" => role.as_str()).increment(1);
}

pub fn record_mux_dropped(reason: &'static str) {
    counter!("twinport_mux_dropped_total", "reason" => reason).increment(1);
}

pub fn record_mux_accept_paused() {
    counter!("twinport_mux_accept_paused_total").increment(1);
}

pub fn record_shutdown_handler(outcome: &'static str) {
    counter!("twinport_shutdown_handlers_total", "outcome" => outcome).increment(1);
}
