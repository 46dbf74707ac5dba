//! ClickHouse columnar store
//!
//! Uses the official `clickhouse-rs` client over HTTP with `RowBinary`
//! encoding and optional LZ4 compression.
//!
//! # Schema
//!
//! ```sql
//! -- append-only, one row per row change
//! CREATE TABLE row_change_event (...)
//! ENGINE = MergeTree
//! PARTITION BY toYYYYMMDD(ingested_at)
//! ORDER BY (gtid, event_time)
//! TTL toDateTime(ingested_at) + INTERVAL 30 DAY
//!
//! -- replace-by-gtid, the highest status version survives merges
//! CREATE TABLE tx_info (...)
//! ENGINE = ReplacingMergeTree(status)
//! ORDER BY gtid
//! TTL toDateTime(commit_time) + INTERVAL 60 DAY
//! ```
//!
//! Versioning `tx_info` by `status` makes `processed` stick even when a late
//! `unprocessed` write for the same GTID lands afterwards. Reads use `FINAL`
//! so unmerged parts never surface a stale version.
//!
//! Timestamps are stored as `DateTime64(3)` and travel as epoch milliseconds.

use super::{group_by_gtid, ColumnarStore, StoredRowChange, StoredTransaction, TransactionStatus};
use crate::config::SensitiveString;
use crate::error::{AuditError, Result};
use crate::event::{RowAction, RowChangeData};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::Client;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ROW_CHANGE_TABLE: &str = "row_change_event";
const TX_INFO_TABLE: &str = "tx_info";

/// Connection and schema settings.
#[derive(Debug, Clone)]
pub struct ClickHouseStoreConfig {
    pub url: String,
    pub database: String,
    pub user: String,
    pub password: Option<SensitiveString>,
    /// LZ4 on the wire
    pub compression: bool,
    /// Create database and tables on connect
    pub init_schema: bool,
    pub row_change_ttl_days: u32,
    pub tx_info_ttl_days: u32,
    /// Startup ping attempts before giving up
    pub connect_attempts: u32,
    pub connect_retry_interval: Duration,
}

impl Default for ClickHouseStoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8123".to_string(),
            database: "audit".to_string(),
            user: "default".to_string(),
            password: None,
            compression: true,
            init_schema: true,
            row_change_ttl_days: 30,
            tx_info_ttl_days: 60,
            connect_attempts: 3,
            connect_retry_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
struct RowChangeRow {
    gtid: String,
    db: String,
    tbl: String,
    action: String,
    event_time: i64,
    data: String,
    queue_partition: i32,
    queue_offset: i64,
    ingested_at: i64,
}

impl RowChangeRow {
    fn from_stored(row: &StoredRowChange) -> Result<Self> {
        Ok(Self {
            gtid: row.gtid.clone(),
            db: row.database.clone(),
            tbl: row.table.clone(),
            action: row.action.as_str().to_string(),
            event_time: row.event_time.timestamp_millis(),
            data: serde_json::to_string(&row.data)?,
            queue_partition: row.partition,
            queue_offset: row.offset,
            ingested_at: row.ingested_at.timestamp_millis(),
        })
    }

    fn into_stored(self) -> Result<StoredRowChange> {
        let data: RowChangeData = serde_json::from_str(&self.data)?;
        Ok(StoredRowChange {
            gtid: self.gtid,
            database: self.db,
            table: self.tbl,
            action: RowAction::parse(&self.action)?,
            event_time: from_millis(self.event_time)?,
            data,
            partition: self.queue_partition,
            offset: self.queue_offset,
            ingested_at: from_millis(self.ingested_at)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, clickhouse::Row)]
struct TxInfoRow {
    gtid: String,
    context: String,
    commit_time: i64,
    status: u8,
}

impl TxInfoRow {
    fn from_stored(tx: &StoredTransaction) -> Self {
        Self {
            gtid: tx.gtid.clone(),
            context: tx.context.clone(),
            commit_time: tx.commit_time.timestamp_millis(),
            status: tx.status.code(),
        }
    }

    fn into_stored(self) -> Result<StoredTransaction> {
        Ok(StoredTransaction {
            gtid: self.gtid,
            context: self.context,
            commit_time: from_millis(self.commit_time)?,
            status: TransactionStatus::from_code(self.status)?,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AuditError::store(format!("timestamp out of range: {}", ms)))
}

fn store_err(what: &str, e: clickhouse::error::Error) -> AuditError {
    AuditError::store(format!("{}: {}", what, e))
}

/// ClickHouse-backed [`ColumnarStore`].
#[derive(Clone)]
pub struct ClickHouseStore {
    client: Client,
    config: ClickHouseStoreConfig,
}

impl ClickHouseStore {
    /// Build the client, verify connectivity and optionally create the schema.
    ///
    /// Fails after `connect_attempts` unsuccessful pings; callers treat this
    /// as fatal.
    pub async fn connect(config: ClickHouseStoreConfig) -> Result<Self> {
        let store = Self {
            client: Self::build_client(&config, Some(&config.database)),
            config,
        };

        store.ping_with_retry().await?;

        if store.config.init_schema {
            store.init_schema().await?;
        }

        Ok(store)
    }

    fn build_client(config: &ClickHouseStoreConfig, database: Option<&str>) -> Client {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_user(&config.user);

        if let Some(database) = database {
            client = client.with_database(database);
        }
        if let Some(ref password) = config.password {
            client = client.with_password(password.expose_secret());
        }
        client = if config.compression {
            client.with_compression(clickhouse::Compression::Lz4)
        } else {
            client.with_compression(clickhouse::Compression::None)
        };

        // Rows carry epoch millis for DateTime64 columns.
        client.with_validation(false)
    }

    async fn ping_with_retry(&self) -> Result<()> {
        let attempts = self.config.connect_attempts.max(1);
        let mut last_err = None;

        for attempt in 1..=attempts {
            match self.ping().await {
                Ok(()) => {
                    info!(url = %self.config.url, attempt, "Connected to ClickHouse");
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        url = %self.config.url,
                        attempt,
                        attempts,
                        "ClickHouse ping failed: {}", e
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.connect_retry_interval).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| AuditError::store("ClickHouse unreachable")))
    }

    /// Create the database and both tables if missing.
    pub async fn init_schema(&self) -> Result<()> {
        let db = &self.config.database;

        // The database may not exist yet, so issue this one without it selected.
        Self::build_client(&self.config, None)
            .query(&format!("CREATE DATABASE IF NOT EXISTS {}", db))
            .execute()
            .await
            .map_err(|e| store_err("create database", e))?;

        let row_change_ddl = format!(
            "CREATE TABLE IF NOT EXISTS {db}.{table} (
                gtid String,
                db LowCardinality(String),
                tbl LowCardinality(String),
                action LowCardinality(String),
                event_time DateTime64(3),
                data String,
                queue_partition Int32,
                queue_offset Int64,
                ingested_at DateTime64(3)
            )
            ENGINE = MergeTree
            PARTITION BY toYYYYMMDD(ingested_at)
            ORDER BY (gtid, event_time)
            TTL toDateTime(ingested_at) + INTERVAL {ttl} DAY",
            db = db,
            table = ROW_CHANGE_TABLE,
            ttl = self.config.row_change_ttl_days,
        );

        let tx_info_ddl = format!(
            "CREATE TABLE IF NOT EXISTS {db}.{table} (
                gtid String,
                context String,
                commit_time DateTime64(3),
                status UInt8
            )
            ENGINE = ReplacingMergeTree(status)
            ORDER BY gtid
            TTL toDateTime(commit_time) + INTERVAL {ttl} DAY",
            db = db,
            table = TX_INFO_TABLE,
            ttl = self.config.tx_info_ttl_days,
        );

        for ddl in [row_change_ddl, tx_info_ddl] {
            self.client
                .query(&ddl)
                .execute()
                .await
                .map_err(|e| store_err("create table", e))?;
        }

        info!(database = %db, "ClickHouse schema ready");
        Ok(())
    }
}

#[async_trait]
impl ColumnarStore for ClickHouseStore {
    async fn ping(&self) -> Result<()> {
        self.client
            .query("SELECT 1")
            .fetch_one::<u8>()
            .await
            .map(|_| ())
            .map_err(|e| store_err("ping", e))
    }

    async fn insert_row_changes(&self, rows: &[StoredRowChange]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let t0 = Instant::now();

        let mut insert = self
            .client
            .insert::<RowChangeRow>(ROW_CHANGE_TABLE)
            .await
            .map_err(|e| store_err("begin insert", e))?;

        for row in rows {
            let row = RowChangeRow::from_stored(row)?;
            insert
                .write(&row)
                .await
                .map_err(|e| store_err("write row", e))?;
        }

        insert.end().await.map_err(|e| {
            counter!("rivven_audit_clickhouse_insert_failures_total").increment(1);
            store_err("insert row changes", e)
        })?;

        debug!(
            rows = rows.len(),
            duration_ms = t0.elapsed().as_millis() as u64,
            "Inserted row changes"
        );
        Ok(())
    }

    async fn upsert_transactions(&self, txs: &[StoredTransaction]) -> Result<()> {
        if txs.is_empty() {
            return Ok(());
        }

        let mut insert = self
            .client
            .insert::<TxInfoRow>(TX_INFO_TABLE)
            .await
            .map_err(|e| store_err("begin insert", e))?;

        for tx in txs {
            insert
                .write(&TxInfoRow::from_stored(tx))
                .await
                .map_err(|e| store_err("write tx", e))?;
        }

        insert
            .end()
            .await
            .map_err(|e| store_err("upsert transactions", e))
    }

    async fn get_transaction(&self, gtid: &str) -> Result<Option<StoredTransaction>> {
        let row = self
            .client
            .query("SELECT ?fields FROM tx_info FINAL WHERE gtid = ? LIMIT 1")
            .bind(gtid)
            .fetch_optional::<TxInfoRow>()
            .await
            .map_err(|e| store_err("get transaction", e))?;

        row.map(TxInfoRow::into_stored).transpose()
    }

    async fn list_row_changes(&self, gtid: &str) -> Result<Vec<StoredRowChange>> {
        let rows = self
            .client
            .query(
                "SELECT ?fields FROM row_change_event WHERE gtid = ? \
                 ORDER BY event_time, queue_partition, queue_offset",
            )
            .bind(gtid)
            .fetch_all::<RowChangeRow>()
            .await
            .map_err(|e| store_err("list row changes", e))?;

        rows.into_iter().map(RowChangeRow::into_stored).collect()
    }

    async fn list_row_changes_for(
        &self,
        gtids: &[String],
    ) -> Result<HashMap<String, Vec<StoredRowChange>>> {
        if gtids.is_empty() {
            return Ok(HashMap::new());
        }

        let rows = self
            .client
            .query("SELECT ?fields FROM row_change_event WHERE has(?, gtid)")
            .bind(gtids.to_vec())
            .fetch_all::<RowChangeRow>()
            .await
            .map_err(|e| store_err("list row changes for set", e))?;

        let stored = rows
            .into_iter()
            .map(RowChangeRow::into_stored)
            .collect::<Result<Vec<_>>>()?;
        Ok(group_by_gtid(stored))
    }

    async fn list_unprocessed(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredTransaction>> {
        let rows = self
            .client
            .query(
                "SELECT ?fields FROM tx_info FINAL \
                 WHERE status = ? AND commit_time >= fromUnixTimestamp64Milli(?) \
                 ORDER BY commit_time DESC LIMIT ?",
            )
            .bind(TransactionStatus::Unprocessed.code())
            .bind(since.timestamp_millis())
            .bind(limit as u64)
            .fetch_all::<TxInfoRow>()
            .await
            .map_err(|e| store_err("list unprocessed", e))?;

        rows.into_iter().map(TxInfoRow::into_stored).collect()
    }

    async fn count_unprocessed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.client
            .query(
                "SELECT count() FROM tx_info FINAL \
                 WHERE status = ? AND commit_time < fromUnixTimestamp64Milli(?)",
            )
            .bind(TransactionStatus::Unprocessed.code())
            .bind(cutoff.timestamp_millis())
            .fetch_one::<u64>()
            .await
            .map_err(|e| store_err("count abandoned", e))
    }
}
