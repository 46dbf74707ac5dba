//! Wire events and the correlated audit record
//!
//! Two independent producers publish JSON onto the queue:
//!
//! - **Row changes** (`db`, `table`, `action`, `gtid`, `time`, `data`), one per
//!   modified row, emitted by the replication reader.
//! - **Transaction markers** (`gtid`, `context`, `time`), one per committed
//!   transaction the application chose to annotate.
//!
//! Both carry the transaction's GTID, which is the only join key.
//!
//! ```ignore
//! let change = RowChangeEvent::decode(&payload)?;
//! let marker = TransactionMarker::decode(&payload)?;
//! assert_eq!(change.gtid, marker.gtid);
//! ```

use crate::error::{AuditError, Result};
use crate::store::StoredRowChange;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Row-level operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RowAction {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

impl RowAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowAction::Insert => "insert",
            RowAction::Update => "update",
            RowAction::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "insert" => Ok(RowAction::Insert),
            "update" => Ok(RowAction::Update),
            "delete" => Ok(RowAction::Delete),
            other => Err(AuditError::serialization(format!(
                "unknown row action '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for RowAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Before/after images of a changed row.
///
/// `before` is absent for inserts, `after` is absent for deletes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowChangeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
}

/// A single row insert/update/delete, tagged with its transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChangeEvent {
    /// Database (schema) name
    #[serde(rename = "db")]
    pub database: String,
    /// Table name
    pub table: String,
    /// Operation
    pub action: RowAction,
    /// Transaction identifier (correlation key)
    pub gtid: String,
    /// Event time (Unix epoch seconds on the wire)
    #[serde(rename = "time", with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    /// Row images
    #[serde(default)]
    pub data: RowChangeData,
}

impl RowChangeEvent {
    /// Create a new event with empty row images.
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        action: RowAction,
        gtid: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            action,
            gtid: gtid.into(),
            timestamp,
            data: RowChangeData::default(),
        }
    }

    /// Set the row image before the change.
    pub fn with_before(mut self, before: serde_json::Value) -> Self {
        self.data.before = Some(before);
        self
    }

    /// Set the row image after the change.
    pub fn with_after(mut self, after: serde_json::Value) -> Self {
        self.data.after = Some(after);
        self
    }

    /// Decode from a queue payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode to a queue payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Fully-qualified `db.table` name.
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }
}

impl fmt::Display for RowChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{} gtid={}",
            self.action, self.database, self.table, self.gtid
        )
    }
}

/// Commit-time marker carrying caller context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMarker {
    /// Transaction identifier (correlation key)
    pub gtid: String,
    /// Opaque caller-supplied context (user, request id, ...)
    #[serde(default)]
    pub context: String,
    /// Commit time (Unix epoch seconds on the wire)
    #[serde(rename = "time", with = "chrono::serde::ts_seconds")]
    pub commit_time: DateTime<Utc>,
}

impl TransactionMarker {
    pub fn new(
        gtid: impl Into<String>,
        context: impl Into<String>,
        commit_time: DateTime<Utc>,
    ) -> Self {
        Self {
            gtid: gtid.into(),
            context: context.into(),
            commit_time,
        }
    }

    /// Decode from a queue payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }

    /// Encode to a queue payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// A transaction marker joined with the row changes it committed.
///
/// Row changes are ordered by event time, then by queue partition and offset.
/// Records are handed to an [`AuditHandler`](crate::handler::AuditHandler) and
/// never persisted by the pipeline itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelatedAuditRecord {
    pub commit_time: DateTime<Utc>,
    pub context: String,
    pub gtid: String,
    pub row_changes: Vec<StoredRowChange>,
}

impl CorrelatedAuditRecord {
    pub fn new(
        gtid: impl Into<String>,
        context: impl Into<String>,
        commit_time: DateTime<Utc>,
        mut row_changes: Vec<StoredRowChange>,
    ) -> Self {
        row_changes.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Self {
            commit_time,
            context: context.into(),
            gtid: gtid.into(),
            row_changes,
        }
    }

    /// Tables touched by the transaction, in first-touch order.
    pub fn tables(&self) -> Vec<String> {
        let mut tables: Vec<String> = Vec::new();
        for change in &self.row_changes {
            let name = format!("{}.{}", change.database, change.table);
            if !tables.contains(&name) {
                tables.push(name);
            }
        }
        tables
    }
}

impl fmt::Display for CorrelatedAuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gtid={} context={} changes={} committed={}",
            self.gtid,
            self.context,
            self.row_changes.len(),
            self.commit_time.to_rfc3339()
        )
    }
}
