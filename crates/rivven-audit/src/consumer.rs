//! Cursor-backed partition consumption
//!
//! A [`PartitionFeed`] owns the read position of one `(topic, partition)`.
//! It resumes from the stored cursor (or the configured start offset), polls
//! the queue with an empty-poll delay and backs off exponentially on
//! retriable fetch errors. The feed never writes the cursor itself: whoever
//! finishes processing a message persists it.

use crate::cursor::CursorStore;
use crate::error::Result;
use crate::metrics::AuditMetrics;
use crate::queue::{MessageQueue, QueueMessage, StartOffset};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Polling behaviour shared by all partition feeds.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    /// Position used when no cursor is stored
    pub start_offset: StartOffset,
    /// Max messages per fetch
    pub max_messages: usize,
    /// Sleep after a fetch returned nothing
    pub empty_poll_delay: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            start_offset: StartOffset::Earliest,
            max_messages: 500,
            empty_poll_delay: Duration::from_millis(100),
            retry_initial: Duration::from_millis(100),
            retry_max: Duration::from_secs(10),
        }
    }
}

pub struct PartitionFeed {
    queue: Arc<dyn MessageQueue>,
    metrics: Arc<AuditMetrics>,
    config: FeedConfig,
    topic: String,
    partition: i32,
    position: i64,
    backoff: Duration,
}

impl PartitionFeed {
    /// Resolve the starting position for `topic/partition`.
    pub async fn open(
        queue: Arc<dyn MessageQueue>,
        cursors: Arc<dyn CursorStore>,
        metrics: Arc<AuditMetrics>,
        config: FeedConfig,
        topic: &str,
        partition: i32,
    ) -> Result<Self> {
        let position = match cursors.get(topic, partition)? {
            Some(offset) => {
                info!(topic, partition, offset, "Resuming from stored cursor");
                offset
            }
            None => {
                let offset = queue
                    .offset_at(topic, partition, config.start_offset)
                    .await?;
                info!(
                    topic,
                    partition,
                    offset,
                    start = ?config.start_offset,
                    "No stored cursor, starting from configured position"
                );
                offset
            }
        };

        let backoff = config.retry_initial;
        Ok(Self {
            queue,
            metrics,
            config,
            topic: topic.to_string(),
            partition,
            position,
            backoff,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset of the next message to be read.
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Wait for the next non-empty batch.
    ///
    /// Retriable fetch errors are logged and retried with backoff. A closed
    /// partition or a permanent error (such as a partition that does not
    /// exist) is returned. Cancel-safe: the position only moves in
    /// [`advance`](Self::advance).
    pub async fn next_batch(&mut self) -> Result<Vec<QueueMessage>> {
        loop {
            match self
                .queue
                .fetch(
                    &self.topic,
                    self.partition,
                    self.position,
                    self.config.max_messages,
                )
                .await
            {
                Ok(batch) if batch.is_empty() => {
                    self.backoff = self.config.retry_initial;
                    tokio::time::sleep(self.config.empty_poll_delay).await;
                }
                Ok(batch) => {
                    self.backoff = self.config.retry_initial;
                    return Ok(batch);
                }
                Err(e) if !e.is_retriable() => {
                    if !e.is_closed() {
                        self.metrics.record_fetch_error(&e);
                    }
                    return Err(e);
                }
                Err(e) => {
                    self.metrics.record_fetch_error(&e);
                    warn!(
                        topic = %self.topic,
                        partition = self.partition,
                        offset = self.position,
                        backoff_ms = self.backoff.as_millis() as u64,
                        "Fetch failed: {}", e
                    );
                    tokio::time::sleep(self.backoff).await;
                    self.backoff = (self.backoff * 2).min(self.config.retry_max);
                }
            }
        }
    }

    /// Move past `offset`. Persisting the cursor is left to the caller.
    pub fn advance(&mut self, offset: i64) {
        self.position = offset + 1;
    }
}
