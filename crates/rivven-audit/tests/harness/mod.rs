//! Test harness for pipeline integration tests
//!
//! Runs the full pipeline against the in-memory queue and store with short
//! intervals, and collects delivered records for assertions.

#![allow(dead_code)]

use chrono::{DateTime, Utc};
use rivven_audit::{
    AuditHandler, CorrelatedAuditRecord, FnAuditHandler, MemoryQueue, PipelineSettings, RowAction,
    RowChangeEvent, TransactionMarker,
};
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT: Once = Once::new();

/// Initialize test logging (idempotent)
pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("rivven_audit=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub const ROW_TOPIC: &str = "binlog";
pub const MARKER_TOPIC: &str = "tx_info";

/// Upper bound for any single wait in a test
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default settings with every interval shortened for tests.
pub fn fast_settings() -> PipelineSettings {
    let mut settings = PipelineSettings::default();
    settings.feed.empty_poll_delay = Duration::from_millis(10);
    settings.feed.retry_initial = Duration::from_millis(10);
    settings.feed.retry_max = Duration::from_millis(100);
    settings.batch.flush_interval = Duration::from_millis(50);
    settings.correlator.retry_interval = Duration::from_millis(50);
    settings.sweeper.interval = Duration::from_millis(100);
    settings
}

pub async fn memory_queue(partitions: usize) -> Arc<MemoryQueue> {
    let queue = Arc::new(MemoryQueue::new());
    queue.create_topic(ROW_TOPIC, partitions).await;
    queue.create_topic(MARKER_TOPIC, partitions).await;
    queue
}

pub async fn publish_row(
    queue: &MemoryQueue,
    partition: i32,
    table: &str,
    gtid: &str,
    time: DateTime<Utc>,
) -> i64 {
    let event = RowChangeEvent::new("shop", table, RowAction::Update, gtid, time)
        .with_before(json!({"id": 1, "status": "new"}))
        .with_after(json!({"id": 1, "status": "paid"}));
    queue
        .publish_to(ROW_TOPIC, partition, &event.encode().unwrap())
        .await
        .unwrap()
}

pub async fn publish_marker(queue: &MemoryQueue, partition: i32, gtid: &str, context: &str) -> i64 {
    let marker = TransactionMarker::new(gtid, context, Utc::now());
    queue
        .publish_to(MARKER_TOPIC, partition, &marker.encode().unwrap())
        .await
        .unwrap()
}

/// Collects every delivered record.
#[derive(Clone, Default)]
pub struct RecordSink {
    records: Arc<Mutex<Vec<CorrelatedAuditRecord>>>,
}

impl RecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(&self) -> Arc<dyn AuditHandler> {
        let records = self.records.clone();
        Arc::new(FnAuditHandler::new(move |record: &CorrelatedAuditRecord| {
            records.lock().unwrap().push(record.clone());
            Ok(())
        }))
    }

    pub fn records(&self) -> Vec<CorrelatedAuditRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn gtids(&self) -> Vec<String> {
        self.records().into_iter().map(|r| r.gtid).collect()
    }

    /// Wait until at least `n` records were delivered.
    pub async fn wait_for(&self, n: usize) -> Vec<CorrelatedAuditRecord> {
        let sink = self.clone();
        assert!(
            wait_until(move || {
                let sink = sink.clone();
                async move { sink.records().len() >= n }
            })
            .await,
            "expected {} records, got {:?}",
            n,
            self.gtids()
        );
        self.records()
    }
}

/// Poll `check` every 20ms until it holds or [`WAIT_TIMEOUT`] elapses.
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
