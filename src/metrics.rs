//! Metrics for polyflow.
//!
//! Recorded through the `metrics` facade; the crate installs no exporter,
//! so a host process decides where they go.
//!
//! ## Metrics
//!
//! ### Counters
//! - `polyflow_compilations_total` - Compilations by status
//! - `polyflow_agent_ticks_total` - Agent poll ticks by resulting state
//! - `polyflow_agent_dispatched_total` - Runs dispatched by bucket
//! - `polyflow_agent_handler_total` - Handler outcomes by handler and status
//!
//! ### Histograms
//! - `polyflow_compile_duration_seconds` - Compilation duration
//! - `polyflow_agent_handler_duration_seconds` - Handler duration by handler
//!
//! ### Gauges
//! - `polyflow_agent_inflight` - Handlers currently running

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Compiler Metrics
// =============================================================================

/// Record a compilation outcome and its duration.
pub fn record_compilation(success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!("polyflow_compilations_total", "status" => status).increment(1);
    histogram!("polyflow_compile_duration_seconds").record(duration.as_secs_f64());
}

// =============================================================================
// Agent Metrics
// =============================================================================

/// Record one agent tick.
pub fn record_agent_tick(state: &str) {
    counter!("polyflow_agent_ticks_total", "state" => state.to_string()).increment(1);
}

/// Record runs dispatched from a state bucket.
pub fn record_dispatch(bucket: &str, count: usize) {
    counter!("polyflow_agent_dispatched_total", "bucket" => bucket.to_string())
        .increment(count as u64);
}

/// Record a handler outcome.
pub fn record_handler(handler: &str, success: bool, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "polyflow_agent_handler_total",
        "handler" => handler.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!(
        "polyflow_agent_handler_duration_seconds",
        "handler" => handler.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment in-flight handlers gauge.
pub fn inc_inflight() {
    gauge!("polyflow_agent_inflight").increment(1.0);
}

/// Decrement in-flight handlers gauge.
pub fn dec_inflight() {
    gauge!("polyflow_agent_inflight").decrement(1.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder_is_noop() {
        record_compilation(true, Duration::from_millis(3));
        record_agent_tick("live");
        record_dispatch("queued", 2);
        record_handler("submit_run", false, Duration::from_millis(1));
        inc_inflight();
        dec_inflight();
    }
}
