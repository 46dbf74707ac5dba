//! Kafka-backed queue using [rskafka](https://crates.io/crates/rskafka)
//!
//! Pure Rust, no librdkafka. Partition clients are created lazily and cached
//! per `(topic, partition)`; offsets are owned by the caller, so no consumer
//! group is joined. A topic or partition the broker does not know is
//! reported as [`AuditError::NotFound`] and is not retried.

use super::{MessageQueue, QueueMessage, StartOffset};
use crate::error::{AuditError, Result};
use async_trait::async_trait;
use rskafka::client::error::{Error as ClientError, ProtocolError};
use rskafka::client::partition::{OffsetAt, PartitionClient, UnknownTopicHandling};
use rskafka::client::{Client, ClientBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct KafkaQueueConfig {
    pub brokers: Vec<String>,
    pub connect_timeout: Duration,
    /// Upper bound of a single fetch response
    pub fetch_max_bytes: i32,
    /// Broker-side long-poll wait
    pub fetch_max_wait: Duration,
}

impl Default for KafkaQueueConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            connect_timeout: Duration::from_secs(10),
            fetch_max_bytes: 1_048_576,
            fetch_max_wait: Duration::from_millis(500),
        }
    }
}

pub struct KafkaQueue {
    client: Client,
    config: KafkaQueueConfig,
    partition_clients: RwLock<HashMap<(String, i32), Arc<PartitionClient>>>,
}

impl KafkaQueue {
    pub async fn connect(config: KafkaQueueConfig) -> Result<Self> {
        if config.brokers.is_empty() {
            return Err(AuditError::config("at least one broker is required"));
        }

        let client = tokio::time::timeout(
            config.connect_timeout,
            ClientBuilder::new(config.brokers.clone()).build(),
        )
        .await
        .map_err(|_| {
            AuditError::timeout(format!(
                "connecting to {:?} took longer than {:?}",
                config.brokers, config.connect_timeout
            ))
        })?
        .map_err(|e| AuditError::queue(format!("Failed to create Kafka client: {}", e)))?;

        info!(brokers = ?config.brokers, "Connected to Kafka");

        Ok(Self {
            client,
            config,
            partition_clients: RwLock::new(HashMap::new()),
        })
    }

    async fn partition_client(&self, topic: &str, partition: i32) -> Result<Arc<PartitionClient>> {
        let key = (topic.to_string(), partition);
        if let Some(pc) = self.partition_clients.read().await.get(&key) {
            return Ok(pc.clone());
        }

        let pc = self
            .client
            .partition_client(topic.to_string(), partition, UnknownTopicHandling::Error)
            .await
            .map_err(|e| match e {
                ClientError::ServerError {
                    protocol_error: ProtocolError::UnknownTopicOrPartition,
                    ..
                } => AuditError::not_found(format!("partition {}/{}", topic, partition)),
                e => AuditError::queue(format!(
                    "Failed to get partition client for {}/{}: {}",
                    topic, partition, e
                )),
            })?;
        let pc = Arc::new(pc);

        debug!(topic, partition, "Created partition client");
        self.partition_clients
            .write()
            .await
            .entry(key)
            .or_insert_with(|| pc.clone());
        Ok(pc)
    }
}

#[async_trait]
impl MessageQueue for KafkaQueue {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>> {
        let topics = self
            .client
            .list_topics()
            .await
            .map_err(|e| AuditError::queue(format!("Failed to list topics: {}", e)))?;

        let topic_meta = topics
            .into_iter()
            .find(|t| t.name == topic)
            .ok_or_else(|| AuditError::not_found(format!("topic '{}'", topic)))?;

        Ok(topic_meta.partitions.into_iter().collect())
    }

    async fn offset_at(&self, topic: &str, partition: i32, at: StartOffset) -> Result<i64> {
        let pc = self.partition_client(topic, partition).await?;
        let at = match at {
            StartOffset::Earliest => OffsetAt::Earliest,
            StartOffset::Latest => OffsetAt::Latest,
        };
        pc.get_offset(at)
            .await
            .map_err(|e| AuditError::queue(format!("Failed to get offset: {}", e)))
    }

    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_messages: usize,
    ) -> Result<Vec<QueueMessage>> {
        let pc = self.partition_client(topic, partition).await?;
        let (records, _high_watermark) = pc
            .fetch_records(
                offset,
                1..self.config.fetch_max_bytes,
                self.config.fetch_max_wait.as_millis() as i32,
            )
            .await
            .map_err(|e| AuditError::queue(format!("Failed to fetch records: {}", e)))?;

        Ok(records
            .into_iter()
            // compacted batches can start before the requested offset
            .filter(|r| r.offset >= offset)
            .take(max_messages)
            .map(|r| QueueMessage {
                topic: topic.to_string(),
                partition,
                offset: r.offset,
                key: r.record.key,
                payload: r.record.value.unwrap_or_default(),
                timestamp: r.record.timestamp,
            })
            .collect())
    }
}
