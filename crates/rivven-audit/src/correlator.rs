//! # Transaction correlator
//!
//! Joins each transaction marker with the row changes already in the store.
//!
//! ```text
//!               ┌──────────────── attempt < max ────────────────┐
//!               ▼                                               │
//! marker ──▶ Lookup ──rows found──▶ Resolved: deliver, mark processed
//!               │
//!               └──empty/error, attempts exhausted──▶ Unresolved: mark unprocessed
//! ```
//!
//! Row changes and markers travel through independent pipelines, so a marker
//! commonly arrives before its rows have been flushed. A short bounded retry
//! absorbs typical skew; anything slower is left to the
//! [`ReconciliationSweeper`](crate::sweeper::ReconciliationSweeper), which
//! keeps the marker stream from stalling behind one slow transaction.
//!
//! A failing lookup query counts as "not found" for that attempt. If no
//! attempt succeeds the transaction is still written as unprocessed, so a
//! store hiccup defers the marker instead of losing it.
//!
//! Markers from every partition feed one sequential correlator task through a
//! bounded channel. The correlator persists a marker's cursor once the marker
//! has been resolved or deferred.

use crate::consumer::{FeedConfig, PartitionFeed};
use crate::cursor::CursorStore;
use crate::error::Result;
use crate::event::{CorrelatedAuditRecord, TransactionMarker};
use crate::handler::AuditSender;
use crate::metrics::{AuditMetrics, MarkerOutcome};
use crate::queue::MessageQueue;
use crate::store::{ColumnarStore, StoredRowChange, StoredTransaction, TransactionStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct CorrelatorConfig {
    /// Lookups per marker, including the first
    pub max_attempts: u32,
    /// Wait between lookups
    pub retry_interval: Duration,
    /// Marker channel capacity
    pub channel_capacity: usize,
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_interval: Duration::from_secs(1),
            channel_capacity: 500,
        }
    }
}

/// What happened to a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CorrelationOutcome {
    /// Joined with this many row changes and delivered
    Resolved { row_changes: usize },
    /// No rows yet; stored as unprocessed
    Deferred,
    /// The transaction was already processed; nothing emitted
    AlreadyProcessed,
    /// Marker had no GTID
    Skipped,
}

/// A decoded marker with its queue position. `marker` is `None` for
/// undecodable messages, which only need their cursor committed.
#[derive(Debug)]
pub struct MarkerEnvelope {
    pub partition: i32,
    pub offset: i64,
    pub marker: Option<TransactionMarker>,
}

pub struct TransactionCorrelator {
    store: Arc<dyn ColumnarStore>,
    delivery: AuditSender,
    cursors: Arc<dyn CursorStore>,
    metrics: Arc<AuditMetrics>,
    config: CorrelatorConfig,
    topic: String,
}

impl TransactionCorrelator {
    pub fn new(
        store: Arc<dyn ColumnarStore>,
        delivery: AuditSender,
        cursors: Arc<dyn CursorStore>,
        metrics: Arc<AuditMetrics>,
        config: CorrelatorConfig,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            delivery,
            cursors,
            metrics,
            config,
            topic: topic.into(),
        }
    }

    /// Process markers until the channel closes or shutdown is signalled.
    ///
    /// A marker already being correlated is finished before exiting.
    pub async fn run(
        self,
        mut markers: mpsc::Receiver<MarkerEnvelope>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Correlator shutting down");
                    break;
                }
                envelope = markers.recv() => match envelope {
                    Some(envelope) => self.handle(envelope).await,
                    None => {
                        info!("Marker stream ended, correlator stopped");
                        break;
                    }
                },
            }
        }
    }

    async fn handle(&self, envelope: MarkerEnvelope) {
        if let Some(marker) = &envelope.marker {
            let outcome = self.correlate(marker).await;
            debug!(gtid = %marker.gtid, ?outcome, "Marker handled");
        }

        let next = envelope.offset + 1;
        if let Err(e) = self.cursors.put(&self.topic, envelope.partition, next) {
            self.metrics.record_cursor_error();
            warn!(
                topic = %self.topic,
                partition = envelope.partition,
                offset = next,
                "Failed to persist marker cursor: {}", e
            );
        }
    }

    /// Run the lookup state machine for one marker.
    pub async fn correlate(&self, marker: &TransactionMarker) -> CorrelationOutcome {
        if marker.gtid.trim().is_empty() {
            warn!(context = %marker.context, "Skipping marker without GTID");
            self.metrics.record_marker(MarkerOutcome::Skipped);
            return CorrelationOutcome::Skipped;
        }

        match self.store.get_transaction(&marker.gtid).await {
            Ok(Some(tx)) if tx.is_processed() => {
                debug!(gtid = %marker.gtid, "Transaction already processed");
                self.metrics.record_marker(MarkerOutcome::AlreadyProcessed);
                return CorrelationOutcome::AlreadyProcessed;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(gtid = %marker.gtid, "Status lookup failed, correlating anyway: {}", e);
            }
        }

        let attempts = self.config.max_attempts.max(1);
        for attempt in 1..=attempts {
            self.metrics.record_lookup_attempt();
            match self.store.list_row_changes(&marker.gtid).await {
                Ok(rows) if !rows.is_empty() => return self.resolve(marker, rows).await,
                Ok(_) => {
                    debug!(gtid = %marker.gtid, attempt, attempts, "No row changes yet");
                }
                Err(e) => {
                    self.metrics.record_lookup_error();
                    warn!(
                        gtid = %marker.gtid,
                        attempt,
                        attempts,
                        "Row-change lookup failed, treating as not found: {}", e
                    );
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.retry_interval).await;
            }
        }

        self.defer(marker).await
    }

    async fn resolve(
        &self,
        marker: &TransactionMarker,
        rows: Vec<StoredRowChange>,
    ) -> CorrelationOutcome {
        let row_changes = rows.len();
        let record =
            CorrelatedAuditRecord::new(&marker.gtid, &marker.context, marker.commit_time, rows);

        if self.delivery.send(record).await.is_err() {
            self.metrics.record_delivery(false);
            error!(gtid = %marker.gtid, "Delivery channel closed, audit record dropped");
        }

        let tx = StoredTransaction::from_marker(marker, TransactionStatus::Processed);
        if let Err(e) = self.store.upsert_transaction(&tx).await {
            self.metrics.record_status_write_error();
            error!(gtid = %marker.gtid, "Failed to mark transaction processed: {}", e);
        }

        self.metrics.record_marker(MarkerOutcome::Resolved);
        info!(gtid = %marker.gtid, row_changes, "Transaction correlated");
        CorrelationOutcome::Resolved { row_changes }
    }

    async fn defer(&self, marker: &TransactionMarker) -> CorrelationOutcome {
        let tx = StoredTransaction::from_marker(marker, TransactionStatus::Unprocessed);
        match self.store.upsert_transaction(&tx).await {
            Ok(()) => {
                info!(gtid = %marker.gtid, "No row changes yet, deferred to reconciliation");
            }
            Err(e) => {
                self.metrics.record_status_write_error();
                error!(
                    gtid = %marker.gtid,
                    context = %marker.context,
                    commit_time = %marker.commit_time,
                    "Failed to persist unresolved transaction, marker lost: {}", e
                );
            }
        }
        self.metrics.record_marker(MarkerOutcome::Deferred);
        CorrelationOutcome::Deferred
    }
}

/// Spawn one marker reader per partition of `topic`, all feeding `tx`.
///
/// Readers advance their in-memory position only; the correlator persists
/// the cursor after handling each marker.
pub async fn spawn_marker_feeders(
    queue: Arc<dyn MessageQueue>,
    cursors: Arc<dyn CursorStore>,
    metrics: Arc<AuditMetrics>,
    feed_config: FeedConfig,
    topic: &str,
    tx: mpsc::Sender<MarkerEnvelope>,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let partitions = queue.partitions(topic).await?;
    info!(topic, partitions = partitions.len(), "Starting marker consumption");

    let mut feeds = Vec::with_capacity(partitions.len());
    for partition in partitions {
        feeds.push(
            PartitionFeed::open(
                queue.clone(),
                cursors.clone(),
                metrics.clone(),
                feed_config.clone(),
                topic,
                partition,
            )
            .await?,
        );
    }

    Ok(feeds
        .into_iter()
        .map(|feed| {
            tokio::spawn(run_marker_feed(
                feed,
                tx.clone(),
                metrics.clone(),
                shutdown.subscribe(),
            ))
        })
        .collect())
}

async fn run_marker_feed(
    mut feed: PartitionFeed,
    tx: mpsc::Sender<MarkerEnvelope>,
    metrics: Arc<AuditMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let batch = tokio::select! {
            _ = shutdown.recv() => return,
            res = feed.next_batch() => match res {
                Ok(batch) => batch,
                Err(e) if e.is_closed() => {
                    info!(topic = feed.topic(), partition = feed.partition(), "Marker partition closed");
                    return;
                }
                Err(e) => {
                    error!(topic = feed.topic(), partition = feed.partition(), "Marker feed stopped: {}", e);
                    return;
                }
            },
        };

        for msg in batch {
            let marker = match TransactionMarker::decode(&msg.payload) {
                Ok(marker) => Some(marker),
                Err(e) => {
                    metrics.record_decode_error("marker");
                    warn!(
                        topic = %msg.topic,
                        partition = msg.partition,
                        offset = msg.offset,
                        payload = %String::from_utf8_lossy(&msg.payload),
                        "Dropping malformed marker: {}", e
                    );
                    None
                }
            };

            let envelope = MarkerEnvelope {
                partition: msg.partition,
                offset: msg.offset,
                marker,
            };
            if tx.send(envelope).await.is_err() {
                debug!(topic = feed.topic(), partition = feed.partition(), "Correlator gone");
                return;
            }
            feed.advance(msg.offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::MemoryCursorStore;
    use crate::event::{RowAction, RowChangeEvent};
    use crate::store::MemoryColumnarStore;
    use chrono::Utc;

    struct Harness {
        store: Arc<MemoryColumnarStore>,
        cursors: Arc<MemoryCursorStore>,
        metrics: Arc<AuditMetrics>,
        records: mpsc::Receiver<CorrelatedAuditRecord>,
        correlator: TransactionCorrelator,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryColumnarStore::new());
        let cursors = Arc::new(MemoryCursorStore::new());
        let metrics = Arc::new(AuditMetrics::new());
        let (tx, records) = mpsc::channel(16);
        let correlator = TransactionCorrelator::new(
            store.clone(),
            tx,
            cursors.clone(),
            metrics.clone(),
            CorrelatorConfig::default(),
            "tx_info",
        );
        Harness {
            store,
            cursors,
            metrics,
            records,
            correlator,
        }
    }

    async fn store_row(store: &MemoryColumnarStore, gtid: &str, offset: i64) {
        let now = Utc::now();
        let event = RowChangeEvent::new("shop", "orders", RowAction::Update, gtid, now);
        store
            .insert_row_changes(&[StoredRowChange::from_event(&event, 0, offset, now)])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_on_first_lookup() {
        let mut h = harness();
        store_row(&h.store, "T1", 0).await;
        store_row(&h.store, "T1", 1).await;

        let marker = TransactionMarker::new("T1", "ctx-A", Utc::now());
        let outcome = h.correlator.correlate(&marker).await;

        assert_eq!(outcome, CorrelationOutcome::Resolved { row_changes: 2 });
        assert_eq!(h.metrics.snapshot().lookup_attempts, 1);

        let record = h.records.try_recv().unwrap();
        assert_eq!(record.gtid, "T1");
        assert_eq!(record.context, "ctx-A");
        assert_eq!(record.row_changes.len(), 2);
        assert!(h.records.try_recv().is_err());

        let tx = h.store.get_transaction("T1").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Processed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolves_on_retry() {
        let mut h = harness();
        let store = h.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            store_row(&store, "T2", 0).await;
        });

        let started = tokio::time::Instant::now();
        let outcome = h
            .correlator
            .correlate(&TransactionMarker::new("T2", "", Utc::now()))
            .await;

        assert_eq!(outcome, CorrelationOutcome::Resolved { row_changes: 1 });
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert_eq!(h.metrics.snapshot().lookup_attempts, 3);
        assert!(h.records.try_recv().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_defers_after_exhausting_attempts() {
        let mut h = harness();
        let outcome = h
            .correlator
            .correlate(&TransactionMarker::new("T3", "ctx", Utc::now()))
            .await;

        assert_eq!(outcome, CorrelationOutcome::Deferred);
        assert_eq!(h.metrics.snapshot().lookup_attempts, 3);
        assert!(h.records.try_recv().is_err());

        let tx = h.store.get_transaction("T3").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Unprocessed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_errors_defer_instead_of_dropping() {
        let h = harness();
        store_row(&h.store, "T4", 0).await;
        h.store.set_fail_queries(true);

        let outcome = h
            .correlator
            .correlate(&TransactionMarker::new("T4", "ctx", Utc::now()))
            .await;
        assert_eq!(outcome, CorrelationOutcome::Deferred);

        h.store.set_fail_queries(false);
        let tx = h.store.get_transaction("T4").await.unwrap().unwrap();
        assert_eq!(tx.status, TransactionStatus::Unprocessed);
        let snap = h.metrics.snapshot();
        assert_eq!(snap.lookup_errors, 3);
        assert_eq!(snap.markers_deferred, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_counts_lost_markers_when_status_write_fails() {
        let h = harness();
        h.store.set_fail_upserts(true);

        let outcome = h
            .correlator
            .correlate(&TransactionMarker::new("T5", "ctx", Utc::now()))
            .await;
        assert_eq!(outcome, CorrelationOutcome::Deferred);
        assert_eq!(h.metrics.snapshot().status_write_errors, 1);
    }

    #[tokio::test]
    async fn test_skips_processed_and_empty_gtid() {
        let mut h = harness();
        store_row(&h.store, "T6", 0).await;
        let marker = TransactionMarker::new("T6", "ctx", Utc::now());

        assert!(matches!(
            h.correlator.correlate(&marker).await,
            CorrelationOutcome::Resolved { .. }
        ));
        assert_eq!(
            h.correlator.correlate(&marker).await,
            CorrelationOutcome::AlreadyProcessed
        );
        assert_eq!(
            h.correlator
                .correlate(&TransactionMarker::new("  ", "ctx", Utc::now()))
                .await,
            CorrelationOutcome::Skipped
        );

        assert!(h.records.try_recv().is_ok());
        assert!(h.records.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_commits_marker_cursors() {
        let h = harness();
        store_row(&h.store, "T7", 0).await;

        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tx.send(MarkerEnvelope {
            partition: 1,
            offset: 10,
            marker: Some(TransactionMarker::new("T7", "ctx", Utc::now())),
        })
        .await
        .unwrap();
        tx.send(MarkerEnvelope {
            partition: 1,
            offset: 11,
            marker: None,
        })
        .await
        .unwrap();
        drop(tx);

        h.correlator.run(rx, shutdown_rx).await;

        assert_eq!(h.cursors.get("tx_info", 1).unwrap(), Some(12));
        assert_eq!(h.metrics.snapshot().markers_resolved, 1);
    }
}
