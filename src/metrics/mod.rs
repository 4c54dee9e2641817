//! Prometheus metrics for the supervisor
//!
//! The supervisor has no HTTP surface, so metrics are exported as a
//! node-exporter textfile under the data root after every update outcome.
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{register_gauge, register_int_counter, Encoder, Gauge, IntCounter, TextEncoder};
use std::path::Path;
use std::sync::OnceLock;

/// Container for all supervisor metrics
struct SupervisorMetrics {
    updates_started: IntCounter,
    updates_succeeded: IntCounter,
    updates_failed: IntCounter,
    server_starts: IntCounter,
    critical_failures: IntCounter,
    update_in_flight: Gauge,
}

static METRICS: OnceLock<SupervisorMetrics> = OnceLock::new();

/// Initialize all Prometheus metrics
///
/// Safe to call more than once; only the first call registers.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }

    let metrics = SupervisorMetrics {
        updates_started: register_int_counter!(
            "index_supervisor_updates_started_total",
            "Background dataset updates started"
        )?,
        updates_succeeded: register_int_counter!(
            "index_supervisor_updates_succeeded_total",
            "Background dataset updates that swapped in a new dataset"
        )?,
        updates_failed: register_int_counter!(
            "index_supervisor_updates_failed_total",
            "Background dataset updates that failed or were cancelled"
        )?,
        server_starts: register_int_counter!(
            "index_supervisor_server_starts_total",
            "Successful server launches"
        )?,
        critical_failures: register_int_counter!(
            "index_supervisor_critical_failures_total",
            "Swaps whose backup could not be restored"
        )?,
        update_in_flight: register_gauge!(
            "index_supervisor_update_in_flight",
            "1 while a background update is running"
        )?,
    };

    let _ = METRICS.set(metrics);
    Ok(())
}

pub fn record_update_started() {
    if let Some(m) = METRICS.get() {
        m.updates_started.inc();
        m.update_in_flight.set(1.0);
    }
}

pub fn record_update_finished(succeeded: bool) {
    if let Some(m) = METRICS.get() {
        if succeeded {
            m.updates_succeeded.inc();
        } else {
            m.updates_failed.inc();
        }
        m.update_in_flight.set(0.0);
    }
}

pub fn record_server_start() {
    if let Some(m) = METRICS.get() {
        m.server_starts.inc();
    }
}

pub fn record_critical_failure() {
    if let Some(m) = METRICS.get() {
        m.critical_failures.inc();
    }
}

/// Render all registered metrics in the text exposition format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Write the metrics textfile atomically
pub fn write_textfile(path: &Path) -> std::io::Result<()> {
    let temp_path = path.with_extension("prom.tmp");
    std::fs::write(&temp_path, render())?;
    std::fs::rename(&temp_path, path)
}
