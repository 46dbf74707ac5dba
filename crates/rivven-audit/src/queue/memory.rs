//! In-process partitioned queue
//!
//! Topics are created explicitly with a fixed partition count. After
//! [`MemoryQueue::close`], fetches past the end of a partition return
//! `QueueClosed`, which lets consumers terminate deterministically.

use super::{MessageQueue, QueueMessage, StartOffset};
use crate::error::{AuditError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryQueue {
    topics: RwLock<HashMap<String, Vec<Vec<QueueMessage>>>>,
    closed: AtomicBool,
    fail_fetches: AtomicBool,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic with `partitions` empty partitions. Existing topics are kept.
    pub async fn create_topic(&self, topic: &str, partitions: usize) {
        self.topics
            .write()
            .await
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    /// Append directly to a partition.
    pub async fn publish_to(&self, topic: &str, partition: i32, payload: &[u8]) -> Result<i64> {
        let mut topics = self.topics.write().await;
        let partitions = topics
            .get_mut(topic)
            .ok_or_else(|| AuditError::not_found(format!("topic '{}'", topic)))?;
        let log = partitions.get_mut(partition as usize).ok_or_else(|| {
            AuditError::not_found(format!("partition {}/{}", topic, partition))
        })?;

        let offset = log.len() as i64;
        log.push(QueueMessage {
            topic: topic.to_string(),
            partition,
            offset,
            key: None,
            payload: payload.to_vec(),
            timestamp: Utc::now(),
        });
        Ok(offset)
    }

    /// Signal end-of-stream: drained partitions report `QueueClosed`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Make fetches fail with a transient error until reset.
    pub fn set_fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self, topic: &str, partition: i32) -> usize {
        self.topics
            .read()
            .await
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageQueue for MemoryQueue {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let topics = self.topics.read().await;
        let partitions = topics
            .get(topic)
            .ok_or_else(|| AuditError::not_found(format!("topic '{}'", topic)))?;
        Ok((0..partitions.len() as i32).collect())
    }

    async fn offset_at(&self, topic: &str, partition: i32, at: StartOffset) -> Result<i64> {
        match at {
            StartOffset::Earliest => Ok(0),
            StartOffset::Latest => Ok(self.len(topic, partition).await as i64),
        }
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(AuditError::queue("injected fetch failure"));
        }

        let topics = self.topics.read().await;
        let log = topics
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .ok_or_else(|| {
                AuditError::not_found(format!("partition {}/{}", topic, partition))
            })?;

        let start = offset.max(0) as usize;
        if start >= log.len() && self.closed.load(Ordering::SeqCst) {
            return Err(AuditError::QueueClosed(format!("{}/{}", topic, partition)));
        }

        Ok(log.iter().skip(start).take(max_messages).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_fetch() {
        let queue = MemoryQueue::new();
        queue.create_topic("t", 2).await;
        queue.publish_to("t", 1, b"a").await.unwrap();
        queue.publish_to("t", 1, b"b").await.unwrap();
        queue.publish_to("t", 1, b"c").await.unwrap();

        assert_eq!(queue.partitions("t").await.unwrap(), vec![0, 1]);
        let msgs = queue.fetch("t", 1, 1, 10).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].offset, 1);
        assert_eq!(msgs[0].payload, b"b");

        assert!(queue.fetch("t", 0, 0, 10).await.unwrap().is_empty());
        assert_eq!(
            queue.offset_at("t", 1, StartOffset::Latest).await.unwrap(),
            3
        );
    }

    #[tokio::test]
    async fn test_close_reports_end_of_stream() {
        let queue = MemoryQueue::new();
        queue.create_topic("t", 1).await;
        queue.publish_to("t", 0, b"a").await.unwrap();
        queue.close();

        assert_eq!(queue.fetch("t", 0, 0, 10).await.unwrap().len(), 1);
        let err = queue.fetch("t", 0, 1, 10).await.unwrap_err();
        assert!(err.is_closed());
    }

    #[tokio::test]
    async fn test_unknown_topic() {
        let queue = MemoryQueue::new();
        assert!(matches!(
            queue.partitions("missing").await,
            Err(AuditError::NotFound(_))
        ));
        assert!(queue.publish_to("missing", 0, b"x").await.is_err());

        queue.create_topic("t", 1).await;
        let err = queue.fetch("t", 3, 0, 10).await.unwrap_err();
        assert!(!err.is_retriable());
    }
}
