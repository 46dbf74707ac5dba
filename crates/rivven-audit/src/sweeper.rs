//! # Reconciliation sweeper
//!
//! Periodically retries transactions the correlator had to defer.
//!
//! Each cycle:
//!
//! 1. Load unprocessed transactions committed within the lookback window,
//!    newest first, capped at `batch_limit`.
//! 2. Fetch row changes for all of them in one query.
//! 3. Deliver a record for every transaction that now has rows.
//! 4. Mark all of those processed in one batched upsert.
//!
//! Records are delivered before the batched upsert. If a cycle fails after
//! some deliveries (closed delivery channel or a failed upsert), those
//! transactions are still unprocessed and the next cycle emits them again.
//! Handlers must tolerate such repeats.
//!
//! Transactions still unmatched once they fall out of the lookback window are
//! abandoned. That is a deliberate, bounded loss policy, surfaced through the
//! `rivven_audit_transactions_abandoned` gauge and a warning whenever the
//! abandoned count grows. Abandoned rows stay in the store until their TTL.

use crate::error::{AuditError, Result};
use crate::event::CorrelatedAuditRecord;
use crate::handler::AuditSender;
use crate::metrics::AuditMetrics;
use crate::store::ColumnarStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between cycles
    pub interval: Duration,
    /// Oldest commit time still eligible
    pub lookback: Duration,
    /// Max candidates per cycle
    pub batch_limit: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            lookback: Duration::from_secs(72 * 3600),
            batch_limit: 1000,
        }
    }
}

/// Result of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub candidates: usize,
    pub resolved: usize,
    /// Unprocessed transactions older than the window, if the count query succeeded
    pub abandoned: Option<u64>,
}

pub struct ReconciliationSweeper {
    store: Arc<dyn ColumnarStore>,
    delivery: AuditSender,
    metrics: Arc<AuditMetrics>,
    config: SweeperConfig,
}

impl ReconciliationSweeper {
    pub fn new(
        store: Arc<dyn ColumnarStore>,
        delivery: AuditSender,
        metrics: Arc<AuditMetrics>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            store,
            delivery,
            metrics,
            config,
        }
    }

    /// Run cycles every `interval` until shutdown. The first cycle runs one
    /// interval after start.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Sweeper shutting down");
                    return;
                }
                _ = ticker.tick() => match self.run_cycle().await {
                    Ok(report) if report.resolved > 0 => {
                        info!(
                            candidates = report.candidates,
                            resolved = report.resolved,
                            "Reconciled deferred transactions"
                        );
                    }
                    Ok(report) => {
                        debug!(candidates = report.candidates, "Sweep found nothing to reconcile");
                    }
                    Err(e) => {
                        self.metrics.record_sweep_error();
                        warn!(error_code = e.error_code(), "Sweep cycle failed: {}", e);
                    }
                },
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<SweepReport> {
        let lookback = chrono::Duration::from_std(self.config.lookback)
            .map_err(|e| AuditError::config(format!("lookback out of range: {}", e)))?;
        let since = Utc::now() - lookback;

        let mut report = SweepReport {
            abandoned: self.check_abandoned(since).await,
            ..Default::default()
        };

        let candidates = self
            .store
            .list_unprocessed(since, self.config.batch_limit)
            .await?;
        report.candidates = candidates.len();
        if candidates.is_empty() {
            self.metrics.record_sweep(0);
            return Ok(report);
        }

        let gtids: Vec<String> = candidates.iter().map(|tx| tx.gtid.clone()).collect();
        let mut rows = self.store.list_row_changes_for(&gtids).await?;

        let mut processed = Vec::new();
        for tx in candidates {
            let Some(changes) = rows.remove(&tx.gtid) else {
                continue;
            };
            let record = CorrelatedAuditRecord::new(&tx.gtid, &tx.context, tx.commit_time, changes);
            self.delivery
                .send(record)
                .await
                .map_err(|_| AuditError::ChannelClosed("audit delivery"))?;
            processed.push(tx.into_processed());
        }

        if !processed.is_empty() {
            self.store.upsert_transactions(&processed).await?;
        }

        report.resolved = processed.len();
        self.metrics.record_sweep(report.resolved);
        Ok(report)
    }

    async fn check_abandoned(&self, cutoff: chrono::DateTime<Utc>) -> Option<u64> {
        match self.store.count_unprocessed_before(cutoff).await {
            Ok(count) => {
                let previous = self.metrics.set_abandoned(count);
                if count > previous {
                    warn!(
                        abandoned = count,
                        newly_abandoned = count - previous,
                        lookback_secs = self.config.lookback.as_secs(),
                        "Unresolved transactions aged out of the lookback window"
                    );
                }
                Some(count)
            }
            Err(e) => {
                warn!("Failed to count abandoned transactions: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{RowAction, RowChangeEvent, TransactionMarker};
    use crate::store::{
        MemoryColumnarStore, StoredRowChange, StoredTransaction, TransactionStatus,
    };
    use tokio::sync::mpsc;

    fn sweeper(
        store: Arc<MemoryColumnarStore>,
    ) -> (
        ReconciliationSweeper,
        mpsc::Receiver<CorrelatedAuditRecord>,
        Arc<AuditMetrics>,
    ) {
        let (tx, rx) = mpsc::channel(64);
        let metrics = Arc::new(AuditMetrics::new());
        (
            ReconciliationSweeper::new(store, tx, metrics.clone(), SweeperConfig::default()),
            rx,
            metrics,
        )
    }

    async fn unprocessed(store: &MemoryColumnarStore, gtid: &str, age_hours: i64) {
        let marker = TransactionMarker::new(
            gtid,
            format!("ctx-{}", gtid),
            Utc::now() - chrono::Duration::hours(age_hours),
        );
        store
            .upsert_transaction(&StoredTransaction::from_marker(
                &marker,
                TransactionStatus::Unprocessed,
            ))
            .await
            .unwrap();
    }

    async fn row(store: &MemoryColumnarStore, gtid: &str) {
        let now = Utc::now();
        let event = RowChangeEvent::new("db", "t", RowAction::Delete, gtid, now);
        store
            .insert_row_changes(&[StoredRowChange::from_event(&event, 0, 0, now)])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_resolves_late_rows_and_batches_upsert() {
        let store = Arc::new(MemoryColumnarStore::new());
        unprocessed(&store, "A", 1).await;
        unprocessed(&store, "B", 2).await;
        unprocessed(&store, "C", 3).await;
        row(&store, "A").await;
        row(&store, "C").await;
        let upserts_before = store.upsert_batches();

        let (sweeper, mut rx, metrics) = sweeper(store.clone());
        let report = sweeper.run_cycle().await.unwrap();

        assert_eq!(report.candidates, 3);
        assert_eq!(report.resolved, 2);
        assert_eq!(store.upsert_batches(), upserts_before + 1);

        let mut delivered = vec![rx.try_recv().unwrap().gtid, rx.try_recv().unwrap().gtid];
        delivered.sort();
        assert_eq!(delivered, vec!["A", "C"]);

        let b = store.get_transaction("B").await.unwrap().unwrap();
        assert_eq!(b.status, TransactionStatus::Unprocessed);
        assert_eq!(metrics.snapshot().sweep_resolved, 2);
    }

    #[tokio::test]
    async fn test_processed_transactions_are_not_emitted_again() {
        let store = Arc::new(MemoryColumnarStore::new());
        unprocessed(&store, "A", 1).await;
        row(&store, "A").await;

        let (sweeper, mut rx, _) = sweeper(store.clone());
        assert_eq!(sweeper.run_cycle().await.unwrap().resolved, 1);
        assert!(rx.try_recv().is_ok());

        let second = sweeper.run_cycle().await.unwrap();
        assert_eq!(second.candidates, 0);
        assert_eq!(second.resolved, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_transactions_outside_lookback_are_excluded() {
        let store = Arc::new(MemoryColumnarStore::new());
        unprocessed(&store, "old", 73).await;
        row(&store, "old").await;

        let (sweeper, mut rx, metrics) = sweeper(store.clone());
        let report = sweeper.run_cycle().await.unwrap();

        assert_eq!(report.candidates, 0);
        assert_eq!(report.abandoned, Some(1));
        assert!(rx.try_recv().is_err());
        assert_eq!(metrics.snapshot().abandoned, 1);
        assert_eq!(
            store.get_transaction("old").await.unwrap().unwrap().status,
            TransactionStatus::Unprocessed
        );
    }

    #[tokio::test]
    async fn test_candidate_cap() {
        let store = Arc::new(MemoryColumnarStore::new());
        for i in 0..5 {
            unprocessed(&store, &format!("T{}", i), i + 1).await;
        }
        let (tx, _rx) = mpsc::channel(64);
        let sweeper = ReconciliationSweeper::new(
            store,
            tx,
            Arc::new(AuditMetrics::new()),
            SweeperConfig {
                batch_limit: 2,
                ..Default::default()
            },
        );
        assert_eq!(sweeper.run_cycle().await.unwrap().candidates, 2);
    }

    #[tokio::test]
    async fn test_query_failure_surfaces_as_error() {
        let store = Arc::new(MemoryColumnarStore::new());
        unprocessed(&store, "A", 1).await;
        store.set_fail_queries(true);

        let (sweeper, _rx, _) = sweeper(store);
        let report = sweeper.run_cycle().await;
        assert!(report.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_ticks_on_interval() {
        let store = Arc::new(MemoryColumnarStore::new());
        unprocessed(&store, "A", 1).await;

        let (sweeper, mut rx, metrics) = sweeper(store.clone());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(sweeper.run(shutdown_rx));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(metrics.snapshot().sweep_cycles, 1);
        assert!(rx.try_recv().is_err());

        row(&store, "A").await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(rx.try_recv().unwrap().gtid, "A");

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_upsert_emits_again_next_cycle() {
        let store = Arc::new(MemoryColumnarStore::new());
        unprocessed(&store, "A", 1).await;
        row(&store, "A").await;

        let (sweeper, mut rx, _) = sweeper(store.clone());
        store.set_fail_upserts(true);
        assert!(sweeper.run_cycle().await.is_err());
        assert_eq!(rx.try_recv().unwrap().gtid, "A");

        store.set_fail_upserts(false);
        assert_eq!(sweeper.run_cycle().await.unwrap().resolved, 1);
        assert_eq!(rx.try_recv().unwrap().gtid, "A");
        assert!(store.get_transaction("A").await.unwrap().unwrap().is_processed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let store = Arc::new(MemoryColumnarStore::new());
        let (tx, _rx) = mpsc::channel(64);
        let metrics = Arc::new(AuditMetrics::new());
        let sweeper = ReconciliationSweeper::new(
            store,
            tx,
            metrics.clone(),
            SweeperConfig {
                interval: Duration::ZERO,
                ..Default::default()
            },
        );
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(sweeper.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(metrics.snapshot().sweep_cycles >= 1);

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
