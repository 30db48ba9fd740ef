//! Metrics collection and exposition.
//!
//! # Metrics
//! - `corewarden_process_state` (gauge): 0=stopped 1=starting 2=running 3=stopping 4=crashed
//! - `corewarden_restarts_total` (counter): restart attempts by result
//! - `corewarden_reconciles_total` (counter): reconciles by outcome
//! - `corewarden_traffic_bytes_total` (counter): bytes merged into the ledger by direction
//! - `corewarden_ledger_flushes_total` (counter): flushes by result
//! - `corewarden_ledger_entries` (gauge): unflushed entities
//! - `corewarden_ip_limit_exceeded_total` (counter)
//! - `corewarden_clients_disabled_total` (counter): by reason
//! - `corewarden_job_runs_total` / `corewarden_job_duration_seconds`: per job

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::supervisor::ProcessState;

/// Install the Prometheus exporter on `addr`. Must run inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_process_state(state: ProcessState) {
    gauge!("corewarden_process_state").set(state as u8 as f64);
}

pub fn record_restart(result: &'static str) {
    counter!("corewarden_restarts_total", "result" => result).increment(1);
}

pub fn record_reconcile(outcome: &'static str) {
    counter!("corewarden_reconciles_total", "outcome" => outcome).increment(1);
}

pub fn record_traffic(up: u64, down: u64) {
    counter!("corewarden_traffic_bytes_total", "direction" => "up").increment(up);
    counter!("corewarden_traffic_bytes_total", "direction" => "down").increment(down);
}

pub fn record_flush(result: &'static str) {
    counter!("corewarden_ledger_flushes_total", "result" => result).increment(1);
}

pub fn record_ledger_size(entries: usize) {
    gauge!("corewarden_ledger_entries").set(entries as f64);
}

pub fn record_ip_limit_exceeded() {
    counter!("corewarden_ip_limit_exceeded_total").increment(1);
}

pub fn record_client_disabled(reason: &'static str) {
    counter!("corewarden_clients_disabled_total", "reason" => reason).increment(1);
}

pub fn record_job_run(job: &'static str, ok: bool, elapsed: Duration) {
    let result = if ok { "ok" } else { "error" };
    counter!("corewarden_job_runs_total", "job" => job, "result" => result).increment(1);
    histogram!("corewarden_job_duration_seconds", "job" => job).record(elapsed.as_secs_f64());
}
