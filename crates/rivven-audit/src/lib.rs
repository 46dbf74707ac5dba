//! # rivven-audit - Transaction Audit Correlation for Rivven
//!
//! Joins CDC row changes with transaction commit markers by GTID and emits
//! one correlated audit record per committed transaction.
//!
//! ## Features
//!
//! - `kafka` - Kafka message queue via rskafka
//! - `clickhouse` - ClickHouse columnar store
//!
//! Both are on by default; in-memory implementations of every collaborator
//! are always available.
//!
//! ## Architecture
//!
//! ```text
//!  row-change topic                             marker topic
//!        │                                           │
//!        ▼                                           ▼
//! ┌──────────────┐                          ┌────────────────┐
//! │  Ingestion   │ per partition            │ Marker feeders │ per partition
//! │ decode/filter│                          └───────┬────────┘
//! └──────┬───────┘                                  ▼
//!        ▼                                  ┌────────────────┐
//! ┌──────────────┐   insert    ┌─────────┐  │   Correlator   │
//! │ Batch writer │────────────▶│ Columnar│◀─│ lookup, retry  │
//! │ 512 rows/1s  │             │  store  │  └───────┬────────┘
//! └──────────────┘             │         │          │
//!                              │         │◀─┐       │
//!                              └─────────┘  │       ▼
//!                                   ┌───────┴──┐  ┌──────────────┐
//!                                   │ Sweeper  │─▶│  Dispatcher  │─▶ AuditHandler
//!                                   └──────────┘  └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> rivven_audit::Result<()> {
//! use rivven_audit::{
//!     AuditPipeline, LoggingAuditHandler, MemoryColumnarStore, MemoryCursorStore, MemoryQueue,
//!     PipelineSettings,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let queue = Arc::new(MemoryQueue::new());
//! queue.create_topic("binlog", 1).await;
//! queue.create_topic("tx_info", 1).await;
//!
//! let running = AuditPipeline::new(
//!     PipelineSettings::default(),
//!     queue,
//!     Arc::new(MemoryColumnarStore::new()),
//!     Arc::new(MemoryCursorStore::new()),
//!     Arc::new(LoggingAuditHandler),
//! )
//! .start()
//! .await?;
//!
//! running.shutdown(Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod config;
pub mod consumer;
pub mod correlator;
pub mod cursor;
pub mod error;
pub mod event;
pub mod filter;
pub mod handler;
pub mod ingest;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod sweeper;

pub use config::AuditConfig;
pub use correlator::{CorrelationOutcome, TransactionCorrelator};
pub use cursor::{CursorStore, MemoryCursorStore, RedbCursorStore};
pub use error::{AuditError, Result};
pub use event::{CorrelatedAuditRecord, RowAction, RowChangeEvent, TransactionMarker};
pub use filter::{TableFilter, TableFilterConfig};
pub use handler::{AuditHandler, FnAuditHandler, LoggingAuditHandler};
pub use metrics::{AuditMetrics, AuditMetricsSnapshot};
pub use pipeline::{AuditPipeline, PipelineSettings, RunningPipeline};
pub use queue::{MemoryQueue, MessageQueue, StartOffset};
pub use store::{
    ColumnarStore, MemoryColumnarStore, StoredRowChange, StoredTransaction, TransactionStatus,
};
pub use sweeper::ReconciliationSweeper;
