//! Row-change ingestion
//!
//! One worker per partition of the row-change topic:
//!
//! ```text
//! partition 0 ──▶ decode ─▶ filter ─▶ accept | skip ┐
//! partition 1 ──▶ decode ─▶ filter ─▶ accept | skip ├──▶ batch writer ──▶ cursors
//! partition N ──▶ decode ─▶ filter ─▶ accept | skip ┘
//! ```
//!
//! Messages are handed to the batch writer in partition order. Workers only
//! move their read position in memory; the writer persists the cursor once
//! the rows are flushed. Malformed and filtered messages are dropped and
//! reported as skipped, so the cursor still passes them.

use crate::batch::BatchWriterHandle;
use crate::consumer::{FeedConfig, PartitionFeed};
use crate::cursor::CursorStore;
use crate::error::Result;
use crate::event::RowChangeEvent;
use crate::filter::TableFilter;
use crate::metrics::AuditMetrics;
use crate::queue::{MessageQueue, QueueMessage};
use crate::store::StoredRowChange;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct RowChangeIngestor {
    queue: Arc<dyn MessageQueue>,
    cursors: Arc<dyn CursorStore>,
    writer: BatchWriterHandle,
    filter: Arc<TableFilter>,
    metrics: Arc<AuditMetrics>,
    feed_config: FeedConfig,
    topic: String,
}

impl RowChangeIngestor {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        cursors: Arc<dyn CursorStore>,
        writer: BatchWriterHandle,
        filter: Arc<TableFilter>,
        metrics: Arc<AuditMetrics>,
        feed_config: FeedConfig,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            cursors,
            writer,
            filter,
            metrics,
            feed_config,
            topic: topic.into(),
        }
    }

    /// Open every partition and spawn one worker each.
    ///
    /// Fails if the topic cannot be described or a start offset cannot be
    /// resolved; nothing is spawned in that case.
    pub async fn spawn(self, shutdown: &broadcast::Sender<()>) -> Result<Vec<JoinHandle<()>>> {
        let partitions = self.queue.partitions(&self.topic).await?;
        info!(topic = %self.topic, partitions = partitions.len(), "Starting row-change ingestion");

        let mut feeds = Vec::with_capacity(partitions.len());
        for partition in partitions {
            feeds.push(
                PartitionFeed::open(
                    self.queue.clone(),
                    self.cursors.clone(),
                    self.metrics.clone(),
                    self.feed_config.clone(),
                    &self.topic,
                    partition,
                )
                .await?,
            );
        }

        Ok(feeds
            .into_iter()
            .map(|feed| {
                tokio::spawn(run_partition(
                    feed,
                    self.writer.clone(),
                    self.filter.clone(),
                    self.metrics.clone(),
                    shutdown.subscribe(),
                ))
            })
            .collect())
    }
}

async fn run_partition(
    mut feed: PartitionFeed,
    writer: BatchWriterHandle,
    filter: Arc<TableFilter>,
    metrics: Arc<AuditMetrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let batch = tokio::select! {
            _ = shutdown.recv() => {
                info!(topic = feed.topic(), partition = feed.partition(), "Ingestion worker shutting down");
                return;
            }
            res = feed.next_batch() => match res {
                Ok(batch) => batch,
                Err(e) if e.is_closed() => {
                    info!(topic = feed.topic(), partition = feed.partition(), "Partition closed");
                    return;
                }
                Err(e) => {
                    error!(topic = feed.topic(), partition = feed.partition(), "Ingestion stopped: {}", e);
                    return;
                }
            },
        };

        for msg in batch {
            let handed_off = match decode_row_change(&msg, &filter, &metrics) {
                Some(row) => writer.accept(row).await,
                None => writer.skip(msg.partition, msg.offset).await,
            };
            if handed_off.is_err() {
                warn!(
                    topic = feed.topic(),
                    partition = feed.partition(),
                    offset = msg.offset,
                    "Batch writer closed, stopping ingestion"
                );
                return;
            }
            feed.advance(msg.offset);
        }
    }
}

/// Decode and filter one message. `None` means drop.
pub(crate) fn decode_row_change(
    msg: &QueueMessage,
    filter: &TableFilter,
    metrics: &AuditMetrics,
) -> Option<StoredRowChange> {
    metrics.record_row_change();

    let mut event = match RowChangeEvent::decode(&msg.payload) {
        Ok(event) => event,
        Err(e) => {
            metrics.record_decode_error("row_change");
            warn!(
                topic = %msg.topic,
                partition = msg.partition,
                offset = msg.offset,
                payload = %String::from_utf8_lossy(&msg.payload),
                "Dropping malformed row change: {}", e
            );
            return None;
        }
    };

    if !filter.apply(&mut event) {
        metrics.record_filtered();
        return None;
    }

    Some(StoredRowChange::from_event(
        &event,
        msg.partition,
        msg.offset,
        Utc::now(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{BatchWriterConfig, RowChangeBatchWriter};
    use crate::cursor::MemoryCursorStore;
    use crate::event::RowAction;
    use crate::filter::TableFilterConfig;
    use crate::queue::MemoryQueue;
    use crate::store::{ColumnarStore, MemoryColumnarStore};

    fn payload(db: &str, table: &str, gtid: &str) -> Vec<u8> {
        RowChangeEvent::new(db, table, RowAction::Insert, gtid, Utc::now())
            .encode()
            .unwrap()
    }

    fn message(payload: Vec<u8>) -> QueueMessage {
        QueueMessage {
            topic: "binlog".into(),
            partition: 2,
            offset: 7,
            key: None,
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_decode_row_change() {
        let metrics = AuditMetrics::new();
        let row = decode_row_change(
            &message(payload("shop", "orders", "T1")),
            &TableFilter::allow_all(),
            &metrics,
        )
        .unwrap();
        assert_eq!(row.gtid, "T1");
        assert_eq!(row.partition, 2);
        assert_eq!(row.offset, 7);
    }

    #[test]
    fn test_decode_drops_garbage_and_filtered() {
        let metrics = AuditMetrics::new();
        let filter = TableFilter::new(&TableFilterConfig {
            include_tables: vec!["shop.*".into()],
            ..Default::default()
        })
        .unwrap();

        assert!(decode_row_change(&message(b"{oops".to_vec()), &filter, &metrics).is_none());
        assert!(
            decode_row_change(&message(payload("hr", "salaries", "T")), &filter, &metrics)
                .is_none()
        );

        let snap = metrics.snapshot();
        assert_eq!(snap.row_changes_received, 2);
        assert_eq!(snap.decode_errors, 1);
        assert_eq!(snap.row_changes_filtered, 1);
    }

    #[tokio::test]
    async fn test_workers_forward_and_commit_every_partition() {
        let queue = Arc::new(MemoryQueue::new());
        queue.create_topic("binlog", 2).await;
        queue.publish_to("binlog", 0, &payload("d", "t", "A")).await.unwrap();
        queue.publish_to("binlog", 0, b"not json").await.unwrap();
        queue.publish_to("binlog", 1, &payload("d", "t", "B")).await.unwrap();
        queue.close();

        let store = Arc::new(MemoryColumnarStore::new());
        let cursors = Arc::new(MemoryCursorStore::new());
        let metrics = Arc::new(AuditMetrics::new());
        let (writer, handle) = RowChangeBatchWriter::new(
            store.clone(),
            cursors.clone(),
            "binlog",
            BatchWriterConfig::default(),
            metrics.clone(),
        );
        let writer_task = tokio::spawn(writer.run());

        let (shutdown_tx, _) = broadcast::channel(1);
        let workers = RowChangeIngestor::new(
            queue,
            cursors.clone(),
            handle,
            Arc::new(TableFilter::allow_all()),
            metrics.clone(),
            FeedConfig::default(),
            "binlog",
        )
        .spawn(&shutdown_tx)
        .await
        .unwrap();

        for worker in workers {
            worker.await.unwrap();
        }
        writer_task.await.unwrap();

        assert_eq!(cursors.get("binlog", 0).unwrap(), Some(2));
        assert_eq!(cursors.get("binlog", 1).unwrap(), Some(1));
        assert_eq!(store.row_change_count().await, 2);
        assert_eq!(store.list_row_changes("A").await.unwrap().len(), 1);
        assert_eq!(metrics.snapshot().decode_errors, 1);
    }

    #[tokio::test]
    async fn test_unknown_topic_fails_fast() {
        let queue = Arc::new(MemoryQueue::new());
        let store = Arc::new(MemoryColumnarStore::new());
        let metrics = Arc::new(AuditMetrics::new());
        let (_writer, handle) = RowChangeBatchWriter::new(
            store,
            Arc::new(MemoryCursorStore::new()),
            "binlog",
            BatchWriterConfig::default(),
            metrics.clone(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        let result = RowChangeIngestor::new(
            queue,
            Arc::new(MemoryCursorStore::new()),
            handle,
            Arc::new(TableFilter::allow_all()),
            metrics,
            FeedConfig::default(),
            "missing",
        )
        .spawn(&shutdown_tx)
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rows_accepted_but_unflushed_are_replayed_after_crash() {
        let queue = Arc::new(MemoryQueue::new());
        queue.create_topic("binlog", 1).await;
        for gtid in ["A", "B", "C"] {
            queue.publish_to("binlog", 0, &payload("d", "t", gtid)).await.unwrap();
        }
        let store = Arc::new(MemoryColumnarStore::new());
        let cursors = Arc::new(MemoryCursorStore::new());

        let start = |config: BatchWriterConfig| {
            let metrics = Arc::new(AuditMetrics::new());
            let (writer, handle) = RowChangeBatchWriter::new(
                store.clone(),
                cursors.clone(),
                "binlog",
                config,
                metrics.clone(),
            );
            let ingestor = RowChangeIngestor::new(
                queue.clone(),
                cursors.clone(),
                handle,
                Arc::new(TableFilter::allow_all()),
                metrics.clone(),
                FeedConfig {
                    empty_poll_delay: std::time::Duration::from_millis(5),
                    ..Default::default()
                },
                "binlog",
            );
            (tokio::spawn(writer.run()), ingestor, metrics)
        };

        // first run never reaches a flush
        let (writer_task, ingestor, metrics) = start(BatchWriterConfig {
            flush_interval: std::time::Duration::from_secs(3600),
            ..Default::default()
        });
        let (shutdown_tx, _) = broadcast::channel(1);
        let workers = ingestor.spawn(&shutdown_tx).await.unwrap();
        while metrics.snapshot().row_changes_received < 3 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tokio::task::yield_now().await;
        for worker in &workers {
            worker.abort();
        }
        writer_task.abort();
        let _ = writer_task.await;

        assert_eq!(store.row_change_count().await, 0);
        assert_eq!(cursors.get("binlog", 0).unwrap(), None);

        // restart from the same cursor store
        queue.close();
        let (writer_task, ingestor, _) = start(BatchWriterConfig::default());
        for worker in ingestor.spawn(&shutdown_tx).await.unwrap() {
            worker.await.unwrap();
        }
        writer_task.await.unwrap();

        assert_eq!(store.row_change_count().await, 3);
        assert_eq!(cursors.get("binlog", 0).unwrap(), Some(3));
    }
}
