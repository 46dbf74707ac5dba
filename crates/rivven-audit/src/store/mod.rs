//! Columnar store abstraction
//!
//! The pipeline persists two kinds of rows:
//!
//! | Row | Semantics |
//! |-----|-----------|
//! | [`StoredRowChange`] | Append-only, one per row change, expired by TTL |
//! | [`StoredTransaction`] | Replace-by-GTID, status moves `unprocessed` → `processed` only |
//!
//! The store handle is shared by the batch writer, correlator and sweeper
//! concurrently, so implementations must be internally synchronized.
//!
//! ```text
//! batch writer ──insert_row_changes──▶ ┌──────────────┐
//! correlator ───list_row_changes─────▶ │ ColumnarStore │
//!            ───upsert_transaction───▶ │              │
//! sweeper ──────list_unprocessed─────▶ │              │
//!         ──────list_row_changes_for─▶ └──────────────┘
//! ```

#[cfg(feature = "clickhouse")]
pub mod clickhouse;
pub mod memory;

#[cfg(feature = "clickhouse")]
pub use self::clickhouse::{ClickHouseStore, ClickHouseStoreConfig};
pub use memory::MemoryColumnarStore;

use crate::error::{AuditError, Result};
use crate::event::{RowAction, RowChangeData, RowChangeEvent, TransactionMarker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Resolution state of a transaction.
///
/// The numeric codes are what the store persists; a higher code wins when two
/// versions of the same transaction meet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum TransactionStatus {
    /// Marker seen, no row changes joined yet
    Unprocessed = 1,
    /// Joined and emitted
    Processed = 2,
}

impl TransactionStatus {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            1 => Ok(Self::Unprocessed),
            2 => Ok(Self::Processed),
            other => Err(AuditError::store(format!(
                "unknown transaction status code {}",
                other
            ))),
        }
    }
}

/// A row change as persisted, with its queue position and ingestion time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRowChange {
    pub gtid: String,
    pub database: String,
    pub table: String,
    pub action: RowAction,
    pub event_time: DateTime<Utc>,
    pub data: RowChangeData,
    /// Queue partition the change was read from
    pub partition: i32,
    /// Queue offset within the partition
    pub offset: i64,
    pub ingested_at: DateTime<Utc>,
}

impl StoredRowChange {
    pub fn from_event(
        event: &RowChangeEvent,
        partition: i32,
        offset: i64,
        ingested_at: DateTime<Utc>,
    ) -> Self {
        Self {
            gtid: event.gtid.clone(),
            database: event.database.clone(),
            table: event.table.clone(),
            action: event.action,
            event_time: event.timestamp,
            data: event.data.clone(),
            partition,
            offset,
            ingested_at,
        }
    }

    /// Ordering key inside a correlated record.
    pub fn sort_key(&self) -> (DateTime<Utc>, i32, i64) {
        (self.event_time, self.partition, self.offset)
    }
}

/// Per-transaction status row, keyed by GTID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub gtid: String,
    pub context: String,
    pub commit_time: DateTime<Utc>,
    pub status: TransactionStatus,
}

impl StoredTransaction {
    pub fn from_marker(marker: &TransactionMarker, status: TransactionStatus) -> Self {
        Self {
            gtid: marker.gtid.clone(),
            context: marker.context.clone(),
            commit_time: marker.commit_time,
            status,
        }
    }

    /// Same transaction, marked processed.
    pub fn into_processed(mut self) -> Self {
        self.status = TransactionStatus::Processed;
        self
    }

    pub fn is_processed(&self) -> bool {
        self.status == TransactionStatus::Processed
    }
}

/// Shared read/write access to the columnar store.
#[async_trait]
pub trait ColumnarStore: Send + Sync {
    /// Check connectivity.
    async fn ping(&self) -> Result<()>;

    /// Append a batch of row changes.
    async fn insert_row_changes(&self, rows: &[StoredRowChange]) -> Result<()>;

    /// Upsert a single transaction by GTID.
    async fn upsert_transaction(&self, tx: &StoredTransaction) -> Result<()> {
        self.upsert_transactions(std::slice::from_ref(tx)).await
    }

    /// Upsert many transactions in one write.
    async fn upsert_transactions(&self, txs: &[StoredTransaction]) -> Result<()>;

    /// Point lookup by GTID.
    async fn get_transaction(&self, gtid: &str) -> Result<Option<StoredTransaction>>;

    /// All row changes of one transaction, ordered by event time, partition, offset.
    async fn list_row_changes(&self, gtid: &str) -> Result<Vec<StoredRowChange>>;

    /// Row changes for a set of transactions, grouped by GTID.
    ///
    /// GTIDs without any rows are absent from the map.
    async fn list_row_changes_for(
        &self,
        gtids: &[String],
    ) -> Result<HashMap<String, Vec<StoredRowChange>>>;

    /// Unprocessed transactions committed at or after `since`, newest first, at most `limit`.
    async fn list_unprocessed(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredTransaction>>;

    /// Number of unprocessed transactions committed before `cutoff`.
    async fn count_unprocessed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Group rows by GTID, keeping each group in record order.
pub(crate) fn group_by_gtid(
    rows: impl IntoIterator<Item = StoredRowChange>,
) -> HashMap<String, Vec<StoredRowChange>> {
    let mut grouped: HashMap<String, Vec<StoredRowChange>> = HashMap::new();
    for row in rows {
        grouped.entry(row.gtid.clone()).or_default().push(row);
    }
    for rows in grouped.values_mut() {
        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    }
    grouped
}
