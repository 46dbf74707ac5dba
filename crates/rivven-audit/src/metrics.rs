//! # Pipeline metrics
//!
//! Lock-free counters shared by every pipeline task. Each update is mirrored
//! to the `metrics` crate facade so any installed recorder (Prometheus via
//! [`init_metrics`], statsd, ...) sees it; [`AuditMetrics::snapshot`] reads
//! the local counters without a recorder, which is what tests use.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `rivven_audit_row_changes_received_total` | Counter | Row-change messages consumed |
//! | `rivven_audit_row_changes_filtered_total` | Counter | Row changes dropped by the table filter |
//! | `rivven_audit_decode_errors_total` | Counter | Undecodable messages, by `stream` |
//! | `rivven_audit_flushes_total` | Counter | Batch flushes, by `result` |
//! | `rivven_audit_rows_dropped_total` | Counter | Rows discarded by failed flushes |
//! | `rivven_audit_markers_total` | Counter | Markers by `outcome` |
//! | `rivven_audit_lookup_errors_total` | Counter | Failed row-change lookups |
//! | `rivven_audit_status_write_errors_total` | Counter | Failed transaction status writes |
//! | `rivven_audit_sweep_cycles_total` | Counter | Reconciliation cycles |
//! | `rivven_audit_sweep_resolved_total` | Counter | Transactions resolved by the sweeper |
//! | `rivven_audit_records_delivered_total` | Counter | Records handed to the handler, by `result` |
//! | `rivven_audit_transactions_abandoned` | Gauge | Unprocessed transactions older than the lookback window |
//! | `rivven_audit_flush_duration_seconds` | Histogram | Store insert latency |

use crate::error::{AuditError, Result};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// How a marker left the correlator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerOutcome {
    Resolved,
    Deferred,
    AlreadyProcessed,
    Skipped,
}

impl MarkerOutcome {
    fn label(self) -> &'static str {
        match self {
            MarkerOutcome::Resolved => "resolved",
            MarkerOutcome::Deferred => "deferred",
            MarkerOutcome::AlreadyProcessed => "already_processed",
            MarkerOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Default)]
pub struct AuditMetrics {
    row_changes_received: AtomicU64,
    row_changes_filtered: AtomicU64,
    decode_errors: AtomicU64,
    cursor_errors: AtomicU64,
    fetch_errors: AtomicU64,

    flushes: AtomicU64,
    flush_failures: AtomicU64,
    rows_flushed: AtomicU64,
    rows_dropped: AtomicU64,

    markers_resolved: AtomicU64,
    markers_deferred: AtomicU64,
    markers_already_processed: AtomicU64,
    markers_skipped: AtomicU64,
    lookup_attempts: AtomicU64,
    lookup_errors: AtomicU64,
    status_write_errors: AtomicU64,

    sweep_cycles: AtomicU64,
    sweep_resolved: AtomicU64,
    sweep_errors: AtomicU64,
    abandoned: AtomicU64,

    records_delivered: AtomicU64,
    delivery_failures: AtomicU64,
}

/// Point-in-time copy of [`AuditMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditMetricsSnapshot {
    pub row_changes_received: u64,
    pub row_changes_filtered: u64,
    pub decode_errors: u64,
    pub cursor_errors: u64,
    pub fetch_errors: u64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub rows_flushed: u64,
    pub rows_dropped: u64,
    pub markers_resolved: u64,
    pub markers_deferred: u64,
    pub markers_already_processed: u64,
    pub markers_skipped: u64,
    pub lookup_attempts: u64,
    pub lookup_errors: u64,
    pub status_write_errors: u64,
    pub sweep_cycles: u64,
    pub sweep_resolved: u64,
    pub sweep_errors: u64,
    pub abandoned: u64,
    pub records_delivered: u64,
    pub delivery_failures: u64,
}

impl AuditMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_row_change(&self) {
        self.row_changes_received.fetch_add(1, Ordering::Relaxed);
        counter!("rivven_audit_row_changes_received_total").increment(1);
    }

    pub fn record_filtered(&self) {
        self.row_changes_filtered.fetch_add(1, Ordering::Relaxed);
        counter!("rivven_audit_row_changes_filtered_total").increment(1);
    }

    /// `stream` is `row_change` or `marker`.
    pub fn record_decode_error(&self, stream: &'static str) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
        counter!("rivven_audit_decode_errors_total", "stream" => stream).increment(1);
    }

    pub fn record_cursor_error(&self) {
        self.cursor_errors.fetch_add(1, Ordering::Relaxed);
        counter!("rivven_audit_cursor_errors_total").increment(1);
    }

    pub fn record_fetch_error(&self, err: &AuditError) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
        counter!("rivven_audit_fetch_errors_total", "code" => err.error_code()).increment(1);
    }

    pub fn record_flush(&self, rows: usize, elapsed: Duration) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.rows_flushed.fetch_add(rows as u64, Ordering::Relaxed);
        counter!("rivven_audit_flushes_total", "result" => "ok").increment(1);
        counter!("rivven_audit_rows_flushed_total").increment(rows as u64);
        histogram!("rivven_audit_flush_duration_seconds").record(elapsed.as_secs_f64());
    }

    pub fn record_flush_failure(&self, rows: usize) {
        self.flush_failures.fetch_add(1, Ordering::Relaxed);
        self.rows_dropped.fetch_add(rows as u64, Ordering::Relaxed);
        counter!("rivven_audit_flushes_total", "result" => "error").increment(1);
        counter!("rivven_audit_rows_dropped_total").increment(rows as u64);
    }

    pub fn record_marker(&self, outcome: MarkerOutcome) {
        let slot = match outcome {
            MarkerOutcome::Resolved => &self.markers_resolved,
            MarkerOutcome::Deferred => &self.markers_deferred,
            MarkerOutcome::AlreadyProcessed => &self.markers_already_processed,
            MarkerOutcome::Skipped => &self.markers_skipped,
        };
        slot.fetch_add(1, Ordering::Relaxed);
        counter!("rivven_audit_markers_total", "outcome" => outcome.label()).increment(1);
    }

    pub fn record_lookup_attempt(&self) {
        self.lookup_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup_error(&self) {
        self.lookup_errors.fetch_add(1, Ordering::Relaxed);
        counter!("rivven_audit_lookup_errors_total").increment(1);
    }

    pub fn record_status_write_error(&self) {
        self.status_write_errors.fetch_add(1, Ordering::Relaxed);
        counter!("rivven_audit_status_write_errors_total").increment(1);
    }

    pub fn record_sweep(&self, resolved: usize) {
        self.sweep_cycles.fetch_add(1, Ordering::Relaxed);
        self.sweep_resolved.fetch_add(resolved as u64, Ordering::Relaxed);
        counter!("rivven_audit_sweep_cycles_total").increment(1);
        counter!("rivven_audit_sweep_resolved_total").increment(resolved as u64);
    }

    pub fn record_sweep_error(&self) {
        self.sweep_errors.fetch_add(1, Ordering::Relaxed);
        counter!("rivven_audit_sweep_errors_total").increment(1);
    }

    /// Returns the previous value.
    pub fn set_abandoned(&self, count: u64) -> u64 {
        gauge!("rivven_audit_transactions_abandoned").set(count as f64);
        self.abandoned.swap(count, Ordering::Relaxed)
    }

    pub fn record_delivery(&self, ok: bool) {
        if ok {
            self.records_delivered.fetch_add(1, Ordering::Relaxed);
            counter!("rivven_audit_records_delivered_total", "result" => "ok").increment(1);
        } else {
            self.delivery_failures.fetch_add(1, Ordering::Relaxed);
            counter!("rivven_audit_records_delivered_total", "result" => "error").increment(1);
        }
    }

    pub fn snapshot(&self) -> AuditMetricsSnapshot {
        let load = |a: &AtomicU64| a.load(Ordering::Relaxed);
        AuditMetricsSnapshot {
            row_changes_received: load(&self.row_changes_received),
            row_changes_filtered: load(&self.row_changes_filtered),
            decode_errors: load(&self.decode_errors),
            cursor_errors: load(&self.cursor_errors),
            fetch_errors: load(&self.fetch_errors),
            flushes: load(&self.flushes),
            flush_failures: load(&self.flush_failures),
            rows_flushed: load(&self.rows_flushed),
            rows_dropped: load(&self.rows_dropped),
            markers_resolved: load(&self.markers_resolved),
            markers_deferred: load(&self.markers_deferred),
            markers_already_processed: load(&self.markers_already_processed),
            markers_skipped: load(&self.markers_skipped),
            lookup_attempts: load(&self.lookup_attempts),
            lookup_errors: load(&self.lookup_errors),
            status_write_errors: load(&self.status_write_errors),
            sweep_cycles: load(&self.sweep_cycles),
            sweep_resolved: load(&self.sweep_resolved),
            sweep_errors: load(&self.sweep_errors),
            abandoned: load(&self.abandoned),
            records_delivered: load(&self.records_delivered),
            delivery_failures: load(&self.delivery_failures),
        }
    }
}

/// Install the Prometheus exporter with an HTTP listener on `addr`.
///
/// Must be called from inside a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| AuditError::config(format!("Failed to start Prometheus exporter: {}", e)))?;

    tracing::info!("Prometheus metrics listening on http://{}/metrics", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_snapshot() {
        let metrics = AuditMetrics::new();
        metrics.record_row_change();
        metrics.record_row_change();
        metrics.record_decode_error("row_change");
        metrics.record_flush(2, Duration::from_millis(3));
        metrics.record_flush_failure(5);
        metrics.record_marker(MarkerOutcome::Resolved);
        metrics.record_marker(MarkerOutcome::Deferred);
        metrics.record_sweep(4);
        metrics.record_delivery(true);
        metrics.record_delivery(false);

        let snap = metrics.snapshot();
        assert_eq!(snap.row_changes_received, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.flushes, 1);
        assert_eq!(snap.rows_flushed, 2);
        assert_eq!(snap.flush_failures, 1);
        assert_eq!(snap.rows_dropped, 5);
        assert_eq!(snap.markers_resolved, 1);
        assert_eq!(snap.markers_deferred, 1);
        assert_eq!(snap.sweep_cycles, 1);
        assert_eq!(snap.sweep_resolved, 4);
        assert_eq!(snap.records_delivered, 1);
        assert_eq!(snap.delivery_failures, 1);
    }

    #[test]
    fn test_set_abandoned_returns_previous() {
        let metrics = AuditMetrics::new();
        assert_eq!(metrics.set_abandoned(3), 0);
        assert_eq!(metrics.set_abandoned(5), 3);
        assert_eq!(metrics.snapshot().abandoned, 5);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(AuditMetrics::new().snapshot()).unwrap();
        assert_eq!(json["markers_resolved"], 0);
    }
}
