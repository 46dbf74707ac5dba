//! Pipeline assembly and lifecycle
//!
//! [`AuditPipeline::start`] wires every component and spawns its tasks:
//!
//! | task                  | count          | stops on                    |
//! |-----------------------|----------------|-----------------------------|
//! | row-change ingestion  | per partition  | shutdown signal             |
//! | batch writer          | 1              | all ingestion workers gone  |
//! | marker feeders        | per partition  | shutdown signal             |
//! | correlator            | 1              | shutdown signal             |
//! | sweeper               | 1              | shutdown signal             |
//! | audit dispatcher      | 1              | correlator and sweeper gone |
//!
//! The writer and the dispatcher stop only after their producers, so the
//! writer flushes its remaining buffer and the dispatcher delivers every
//! record already enqueued.

use crate::batch::{BatchWriterConfig, RowChangeBatchWriter};
use crate::consumer::FeedConfig;
use crate::correlator::{spawn_marker_feeders, CorrelatorConfig, TransactionCorrelator};
use crate::cursor::CursorStore;
use crate::error::{AuditError, Result};
use crate::filter::{TableFilter, TableFilterConfig};
use crate::handler::{AuditDispatcher, AuditHandler};
use crate::ingest::RowChangeIngestor;
use crate::metrics::AuditMetrics;
use crate::queue::MessageQueue;
use crate::store::ColumnarStore;
use crate::sweeper::{ReconciliationSweeper, SweeperConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Everything the pipeline needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub row_change_topic: String,
    pub marker_topic: String,
    pub feed: FeedConfig,
    pub batch: BatchWriterConfig,
    pub correlator: CorrelatorConfig,
    pub sweeper: SweeperConfig,
    pub delivery_capacity: usize,
    pub filter: TableFilterConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            row_change_topic: "binlog".to_string(),
            marker_topic: "tx_info".to_string(),
            feed: FeedConfig::default(),
            batch: BatchWriterConfig::default(),
            correlator: CorrelatorConfig::default(),
            sweeper: SweeperConfig::default(),
            delivery_capacity: 1024,
            filter: TableFilterConfig::default(),
        }
    }
}

pub struct AuditPipeline {
    settings: PipelineSettings,
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn ColumnarStore>,
    cursors: Arc<dyn CursorStore>,
    handler: Arc<dyn AuditHandler>,
    metrics: Arc<AuditMetrics>,
}

impl AuditPipeline {
    pub fn new(
        settings: PipelineSettings,
        queue: Arc<dyn MessageQueue>,
        store: Arc<dyn ColumnarStore>,
        cursors: Arc<dyn CursorStore>,
        handler: Arc<dyn AuditHandler>,
    ) -> Self {
        Self {
            settings,
            queue,
            store,
            cursors,
            handler,
            metrics: Arc::new(AuditMetrics::new()),
        }
    }

    /// Share an existing metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<AuditMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Spawn all tasks.
    ///
    /// Fails if either topic cannot be opened.
    /// Tasks spawned before a failure are signalled to stop.
    pub async fn start(self) -> Result<RunningPipeline> {
        let settings = self.settings;
        let filter = Arc::new(TableFilter::new(&settings.filter)?);
        let (shutdown_tx, _) = broadcast::channel::<()>(16);
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let (dispatcher, audit_tx) = AuditDispatcher::new(
            self.handler,
            settings.delivery_capacity,
            self.metrics.clone(),
        );
        tasks.push(tokio::spawn(dispatcher.run()));

        let (writer, writer_handle) = RowChangeBatchWriter::new(
            self.store.clone(),
            self.cursors.clone(),
            settings.row_change_topic.clone(),
            settings.batch.clone(),
            self.metrics.clone(),
        );
        tasks.push(tokio::spawn(writer.run()));

        let ingest = RowChangeIngestor::new(
            self.queue.clone(),
            self.cursors.clone(),
            writer_handle,
            filter,
            self.metrics.clone(),
            settings.feed.clone(),
            settings.row_change_topic.clone(),
        )
        .spawn(&shutdown_tx)
        .await;
        match ingest {
            Ok(workers) => tasks.extend(workers),
            Err(e) => return Err(abort_start(&shutdown_tx, e)),
        }

        let (marker_tx, marker_rx) =
            mpsc::channel(settings.correlator.channel_capacity.max(1));
        let feeders = spawn_marker_feeders(
            self.queue.clone(),
            self.cursors.clone(),
            self.metrics.clone(),
            settings.feed.clone(),
            &settings.marker_topic,
            marker_tx,
            &shutdown_tx,
        )
        .await;
        match feeders {
            Ok(feeders) => tasks.extend(feeders),
            Err(e) => return Err(abort_start(&shutdown_tx, e)),
        }

        let correlator = TransactionCorrelator::new(
            self.store.clone(),
            audit_tx.clone(),
            self.cursors.clone(),
            self.metrics.clone(),
            settings.correlator.clone(),
            settings.marker_topic.clone(),
        );
        tasks.push(tokio::spawn(
            correlator.run(marker_rx, shutdown_tx.subscribe()),
        ));

        let sweeper = ReconciliationSweeper::new(
            self.store,
            audit_tx,
            self.metrics.clone(),
            settings.sweeper.clone(),
        );
        tasks.push(tokio::spawn(sweeper.run(shutdown_tx.subscribe())));

        info!(
            row_change_topic = %settings.row_change_topic,
            marker_topic = %settings.marker_topic,
            tasks = tasks.len(),
            "Audit pipeline started"
        );

        Ok(RunningPipeline {
            shutdown_tx,
            tasks,
            metrics: self.metrics,
        })
    }
}

// Stops whatever was spawned so far. Dropping the local writer handle and
// audit sender on return lets the writer and dispatcher wind down too.
fn abort_start(shutdown_tx: &broadcast::Sender<()>, err: AuditError) -> AuditError {
    warn!("Pipeline start failed: {}", err);
    let _ = shutdown_tx.send(());
    err
}

/// Handle to a started pipeline.
pub struct RunningPipeline {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    metrics: Arc<AuditMetrics>,
}

impl RunningPipeline {
    pub fn metrics(&self) -> &Arc<AuditMetrics> {
        &self.metrics
    }

    /// Signal every task and wait up to `timeout` for all of them to finish.
    pub async fn shutdown(self, timeout: Duration) -> Result<()> {
        info!("Shutting down audit pipeline");
        let _ = self.shutdown_tx.send(());

        let count = self.tasks.len();
        match tokio::time::timeout(timeout, futures::future::join_all(self.tasks)).await {
            Ok(results) => {
                for res in results {
                    if let Err(e) = res {
                        warn!("Pipeline task ended abnormally: {}", e);
                    }
                }
                info!(tasks = count, "Audit pipeline stopped");
                Ok(())
            }
            Err(_) => Err(AuditError::timeout(format!(
                "pipeline tasks did not stop within {:?}",
                timeout
            ))),
        }
    }
}
