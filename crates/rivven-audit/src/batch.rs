//! # Row-change batch writer
//!
//! Buffers row changes, writes them to the columnar store in batches, and
//! owns the row-change topic's cursors.
//!
//! ```text
//! partition workers ──accept()/skip()──▶ [bounded mpsc] ──▶ buffer ──flush──▶ ColumnarStore
//!                                                             ▲                   │
//!                                           size ≥ batch_size ┤ or interval tick  ▼
//!                                                                        CursorStore (watermarks)
//! ```
//!
//! - **Size trigger**: the buffer is flushed as soon as it holds `batch_size` rows.
//! - **Time trigger**: otherwise it is flushed `flush_interval` after the previous flush.
//! - **Watermarks**: every row and every skipped offset (malformed or
//!   filtered message) raises its partition's watermark. Cursors are written
//!   only after the rows below the watermark are in the store, so a crash
//!   replays unflushed rows instead of losing them. A crash between the
//!   insert and the cursor write re-inserts that batch on restart.
//! - **Best effort**: a failed flush is logged with the full batch and the
//!   buffer is cleared anyway. The cursors of the partitions in that batch
//!   are held at their last flushed position until restart, so the dropped
//!   rows are read again by the next run.
//! - **Backpressure**: `accept` blocks while the channel is full.
//!
//! The writer stops when every [`BatchWriterHandle`] has been dropped, after
//! draining the channel, flushing what is left and writing the final cursors.

use crate::cursor::CursorStore;
use crate::error::{AuditError, Result};
use crate::metrics::AuditMetrics;
use crate::store::{ColumnarStore, StoredRowChange};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BatchWriterConfig {
    /// Rows per flush
    pub batch_size: usize,
    /// Max time between flushes
    pub flush_interval: Duration,
    /// Capacity of the intake channel
    pub channel_capacity: usize,
}

impl Default for BatchWriterConfig {
    fn default() -> Self {
        Self {
            batch_size: 512,
            flush_interval: Duration::from_secs(1),
            channel_capacity: 1024,
        }
    }
}

#[derive(Debug)]
enum Intake {
    Row(StoredRowChange),
    Skip { partition: i32, offset: i64 },
}

/// Producer side of the batch writer.
#[derive(Debug, Clone)]
pub struct BatchWriterHandle {
    tx: mpsc::Sender<Intake>,
}

impl BatchWriterHandle {
    /// Enqueue a row change; waits while the writer is saturated.
    pub async fn accept(&self, row: StoredRowChange) -> Result<()> {
        self.send(Intake::Row(row)).await
    }

    /// Record that `offset` produced no row, so the cursor may pass it once
    /// everything before it has been flushed.
    pub async fn skip(&self, partition: i32, offset: i64) -> Result<()> {
        self.send(Intake::Skip { partition, offset }).await
    }

    async fn send(&self, item: Intake) -> Result<()> {
        self.tx
            .send(item)
            .await
            .map_err(|_| AuditError::ChannelClosed("batch writer"))
    }
}

pub struct RowChangeBatchWriter {
    store: Arc<dyn ColumnarStore>,
    cursors: Arc<dyn CursorStore>,
    topic: String,
    config: BatchWriterConfig,
    metrics: Arc<AuditMetrics>,
    rx: mpsc::Receiver<Intake>,
    buffer: Vec<StoredRowChange>,
    /// Highest offset taken in per partition since the last flush
    pending: BTreeMap<i32, i64>,
    /// Partitions whose cursor stays put after a failed flush
    held: BTreeSet<i32>,
}

impl RowChangeBatchWriter {
    pub fn new(
        store: Arc<dyn ColumnarStore>,
        cursors: Arc<dyn CursorStore>,
        topic: impl Into<String>,
        config: BatchWriterConfig,
        metrics: Arc<AuditMetrics>,
    ) -> (Self, BatchWriterHandle) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let buffer = Vec::with_capacity(config.batch_size);
        (
            Self {
                store,
                cursors,
                topic: topic.into(),
                config,
                metrics,
                rx,
                buffer,
                pending: BTreeMap::new(),
                held: BTreeSet::new(),
            },
            BatchWriterHandle { tx },
        )
    }

    /// Run until all handles are dropped.
    pub async fn run(mut self) {
        let period = self.config.flush_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_item = self.rx.recv() => match maybe_item {
                    Some(Intake::Row(row)) => {
                        self.mark(row.partition, row.offset);
                        self.buffer.push(row);
                        if self.buffer.len() >= self.config.batch_size {
                            self.flush().await;
                            ticker.reset();
                        }
                    }
                    Some(Intake::Skip { partition, offset }) => {
                        self.mark(partition, offset);
                    }
                    None => {
                        self.flush().await;
                        info!("Batch writer stopped");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }
    }

    fn mark(&mut self, partition: i32, offset: i64) {
        let mark = self.pending.entry(partition).or_insert(offset);
        *mark = (*mark).max(offset);
    }

    async fn flush(&mut self) {
        if !self.buffer.is_empty() {
            let batch = std::mem::replace(
                &mut self.buffer,
                Vec::with_capacity(self.config.batch_size),
            );
            let t0 = Instant::now();

            match self.store.insert_row_changes(&batch).await {
                Ok(()) => {
                    self.metrics.record_flush(batch.len(), t0.elapsed());
                    debug!(rows = batch.len(), "Flushed row changes");
                }
                Err(e) => {
                    self.metrics.record_flush_failure(batch.len());
                    error!(
                        rows = batch.len(),
                        error_code = e.error_code(),
                        batch = %serde_json::to_string(&batch).unwrap_or_default(),
                        "Failed to flush row changes, batch dropped: {}", e
                    );
                    for row in &batch {
                        if self.held.insert(row.partition) {
                            warn!(
                                topic = %self.topic,
                                partition = row.partition,
                                "Holding cursor until restart so dropped rows are replayed"
                            );
                        }
                    }
                }
            }
        }

        self.commit_watermarks();
    }

    fn commit_watermarks(&mut self) {
        for (partition, offset) in std::mem::take(&mut self.pending) {
            if self.held.contains(&partition) {
                continue;
            }
            let next = offset + 1;
            if let Err(e) = self.cursors.put(&self.topic, partition, next) {
                self.metrics.record_cursor_error();
                warn!(
                    topic = %self.topic,
                    partition,
                    offset = next,
                    "Failed to persist cursor: {}", e
                );
            } else {
                debug!(topic = %self.topic, partition, offset = next, "Cursor advanced");
            }
        }
    }
}
