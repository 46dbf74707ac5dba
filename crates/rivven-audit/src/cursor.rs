//! Durable consumer cursors
//!
//! One entry per `(topic, partition)`, keyed as `"{topic}-{partition}"`. The
//! stored value is the offset of the *next* message to read, so resuming never
//! replays the last processed message.
//!
//! [`RedbCursorStore`] keeps cursors in an embedded [redb](https://crates.io/crates/redb)
//! file; each logical namespace gets its own table. Each topic has a single
//! writer: the batch writer for row changes, the correlator for markers.

use crate::error::{AuditError, Result};
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

/// Default table name for cursors.
pub const DEFAULT_NAMESPACE: &str = "kafka";

/// A stored position in a partitioned stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub topic: String,
    pub partition: i32,
    /// Next offset to read
    pub offset: i64,
}

/// Persistent `(topic, partition) -> offset` map.
pub trait CursorStore: Send + Sync {
    fn get(&self, topic: &str, partition: i32) -> Result<Option<i64>>;

    fn put(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;

    /// All cursors, ordered by topic then partition.
    fn list(&self) -> Result<Vec<Cursor>>;
}

fn cursor_key(topic: &str, partition: i32) -> String {
    format!("{}-{}", topic, partition)
}

fn parse_key(key: &str) -> Option<(String, i32)> {
    let (topic, partition) = key.rsplit_once('-')?;
    Some((topic.to_string(), partition.parse().ok()?))
}

fn sorted(mut cursors: Vec<Cursor>) -> Vec<Cursor> {
    cursors.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
    cursors
}

/// redb-backed cursor store.
pub struct RedbCursorStore {
    db: Database,
    namespace: String,
}

impl RedbCursorStore {
    /// Open (or create) the cursor file at `path`.
    pub fn open(path: impl AsRef<Path>, namespace: impl Into<String>) -> Result<Self> {
        let path = path.as_ref();
        let namespace = namespace.into();
        if namespace.is_empty() {
            return Err(AuditError::config("cursor namespace must not be empty"));
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AuditError::cursor(format!("Failed to create dir {}: {}", parent.display(), e))
                })?;
            }
        }

        let db = Database::create(path)
            .map_err(|e| AuditError::cursor(format!("Failed to open redb: {}", e)))?;

        debug!(path = %path.display(), namespace = %namespace, "Opened cursor store");
        Ok(Self { db, namespace })
    }

    fn table(&self) -> TableDefinition<'_, &'static str, i64> {
        TableDefinition::new(&self.namespace)
    }
}

impl CursorStore for RedbCursorStore {
    fn get(&self, topic: &str, partition: i32) -> Result<Option<i64>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| AuditError::cursor(e.to_string()))?;

        let table = match read_txn.open_table(self.table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(AuditError::cursor(e.to_string())),
        };

        let value = table
            .get(cursor_key(topic, partition).as_str())
            .map_err(|e| AuditError::cursor(e.to_string()))?;
        Ok(value.map(|v| v.value()))
    }

    fn put(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| AuditError::cursor(e.to_string()))?;
        {
            let mut table = write_txn
                .open_table(self.table())
                .map_err(|e| AuditError::cursor(e.to_string()))?;
            table
                .insert(cursor_key(topic, partition).as_str(), offset)
                .map_err(|e| AuditError::cursor(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| AuditError::cursor(e.to_string()))?;
        Ok(())
    }

    fn list(&self) -> Result<Vec<Cursor>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| AuditError::cursor(e.to_string()))?;

        let table = match read_txn.open_table(self.table()) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(AuditError::cursor(e.to_string())),
        };

        let mut cursors = Vec::new();
        for entry in table.iter().map_err(|e| AuditError::cursor(e.to_string()))? {
            let (key, value) = entry.map_err(|e| AuditError::cursor(e.to_string()))?;
            if let Some((topic, partition)) = parse_key(key.value()) {
                cursors.push(Cursor {
                    topic,
                    partition,
                    offset: value.value(),
                });
            }
        }
        Ok(sorted(cursors))
    }
}

/// Volatile cursor store for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: RwLock<HashMap<(String, i32), i64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CursorStore for MemoryCursorStore {
    fn get(&self, topic: &str, partition: i32) -> Result<Option<i64>> {
        Ok(self
            .cursors
            .read()
            .get(&(topic.to_string(), partition))
            .copied())
    }

    fn put(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        self.cursors
            .write()
            .insert((topic.to_string(), partition), offset);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Cursor>> {
        let cursors = self.cursors.read();
        Ok(sorted(
            cursors
                .iter()
                .map(|((topic, partition), offset)| Cursor {
                    topic: topic.clone(),
                    partition: *partition,
                    offset: *offset,
                })
                .collect(),
        ))
    }
}
