//! Partitioned message queue abstraction
//!
//! The pipeline consumes two topics partition by partition and keeps its own
//! offsets in the [`CursorStore`](crate::cursor::CursorStore), so the queue
//! only needs offset-addressed fetches. No consumer-group coordination is
//! involved.

#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

#[cfg(feature = "kafka")]
pub use kafka::{KafkaQueue, KafkaQueueConfig};
pub use memory::MemoryQueue;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where to start a partition that has no stored cursor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartOffset {
    /// Oldest retained message
    #[default]
    Earliest,
    /// Only messages produced after startup
    Latest,
}

/// A message read from a topic partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Partition ids of a topic, ascending.
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>>;

    /// Resolve a logical start position to a concrete offset.
    async fn offset_at(&self, topic: &str, partition: i32, at: StartOffset) -> Result<i64>;

    /// Fetch up to `max_messages` starting at `offset`.
    ///
    /// Returns an empty vector when nothing is available yet,
    /// [`AuditError::QueueClosed`](crate::error::AuditError::QueueClosed) once
    /// the partition will never yield more messages, and
    /// [`AuditError::NotFound`](crate::error::AuditError::NotFound) if the
    /// partition does not exist.
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>>;
}
