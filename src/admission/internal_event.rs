//! Emission helpers for the limiter's observable signals.
//!
//! Everything here is fire-and-forget: histograms for the adaptive values,
//! counters for shed and backoff events, each paired with a trace-level
//! event under the `admission::stats` target.

use metrics::{counter, histogram};

use super::stage::Stage;

pub(crate) fn emit_limit(limit: usize, stage: Stage) {
    histogram!("admission_concurrency_limit").record(limit as f64);
    trace!(target: "admission::stats", limit, stage = %stage, "Limit adjusted");
}

pub(crate) fn emit_in_flight(in_flight: usize) {
    histogram!("admission_in_flight").record(in_flight as f64);
    trace!(target: "admission::stats", in_flight, "In-flight updated");
}

pub(crate) fn emit_dropped() {
    counter!("admission_dropped_total").increment(1);
    trace!(target: "admission::stats", "Waiter dropped");
}

pub(crate) fn emit_backoff() {
    counter!("admission_backoff_total").increment(1);
    trace!(target: "admission::stats", "Backoff signalled");
}
