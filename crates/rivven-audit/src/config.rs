//! YAML configuration
//!
//! ```yaml
//! queue:
//!   brokers: ["${KAFKA_BROKERS:-localhost:9092}"]
//!   row_change_topic: binlog
//!   marker_topic: tx_info
//! store:
//!   url: http://localhost:8123
//!   database: audit
//!   password: ${CLICKHOUSE_PASSWORD}
//! cursor:
//!   path: ./data/cursors.redb
//! ```
//!
//! Every other field has a default. `${VAR}` and `${VAR:-default}` are
//! expanded from the environment before parsing.

use crate::batch::BatchWriterConfig;
use crate::consumer::FeedConfig;
use crate::correlator::CorrelatorConfig;
use crate::error::{AuditError, Result};
use crate::filter::{TableFilter, TableFilterConfig};
use crate::pipeline::PipelineSettings;
use crate::queue::StartOffset;
use crate::sweeper::SweeperConfig;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var pattern is valid")
});

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AuditConfig {
    #[serde(default)]
    #[validate(nested)]
    pub queue: QueueSection,

    #[serde(default)]
    #[validate(nested)]
    pub store: StoreSection,

    #[serde(default)]
    pub cursor: CursorSection,

    #[serde(default)]
    #[validate(nested)]
    pub batch: BatchSection,

    #[serde(default)]
    #[validate(nested)]
    pub correlator: CorrelatorSection,

    #[serde(default)]
    #[validate(nested)]
    pub sweeper: SweeperSection,

    #[serde(default)]
    #[validate(nested)]
    pub delivery: DeliverySection,

    #[serde(default)]
    pub filter: TableFilterConfig,

    #[serde(default)]
    pub metrics: MetricsSection,

    /// Max time to wait for tasks on shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    #[validate(range(min = 1, max = 600))]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct QueueSection {
    #[serde(default = "default_brokers")]
    #[validate(length(min = 1))]
    pub brokers: Vec<String>,

    #[serde(default = "default_row_change_topic")]
    #[validate(length(min = 1))]
    pub row_change_topic: String,

    #[serde(default = "default_marker_topic")]
    #[validate(length(min = 1))]
    pub marker_topic: String,

    #[serde(default)]
    pub start_offset: StartOffset,

    #[serde(default = "default_max_messages")]
    #[validate(range(min = 1, max = 100000))]
    pub max_messages: usize,

    #[serde(default = "default_empty_poll_delay_ms")]
    pub empty_poll_delay_ms: u64,

    #[serde(default = "default_fetch_max_bytes")]
    #[validate(range(min = 1024))]
    pub fetch_max_bytes: i32,

    #[serde(default = "default_fetch_max_wait_ms")]
    #[validate(range(min = 1, max = 60000))]
    pub fetch_max_wait_ms: i32,

    #[serde(default = "default_connect_timeout_secs")]
    #[validate(range(min = 1))]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_retry_initial_ms")]
    #[validate(range(min = 1))]
    pub retry_initial_ms: u64,

    #[serde(default = "default_retry_max_ms")]
    #[validate(range(min = 1))]
    pub retry_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoreSection {
    #[serde(default = "default_store_url")]
    #[validate(length(min = 1))]
    pub url: String,

    #[serde(default = "default_database")]
    #[validate(length(min = 1))]
    pub database: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub password: Option<SensitiveString>,

    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default = "default_true")]
    pub init_schema: bool,

    #[serde(default = "default_row_change_ttl_days")]
    #[validate(range(min = 1))]
    pub row_change_ttl_days: u32,

    #[serde(default = "default_tx_info_ttl_days")]
    #[validate(range(min = 1))]
    pub tx_info_ttl_days: u32,

    #[serde(default = "default_connect_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub connect_attempts: u32,

    #[serde(default = "default_connect_retry_interval_secs")]
    pub connect_retry_interval_secs: u64,
}

/// Credential that never shows up in logs or config dumps.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.expose_secret().is_empty()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorSection {
    #[serde(default = "default_cursor_path")]
    pub path: PathBuf,

    #[serde(default = "default_cursor_namespace")]
    pub namespace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatchSection {
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 1000000))]
    pub size: usize,

    #[serde(default = "default_batch_interval_ms")]
    #[validate(range(min = 1))]
    pub interval_ms: u64,

    #[serde(default = "default_channel_capacity")]
    #[validate(range(min = 1))]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CorrelatorSection {
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 100))]
    pub max_attempts: u32,

    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,

    #[serde(default = "default_marker_channel_capacity")]
    #[validate(range(min = 1))]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SweeperSection {
    #[serde(default = "default_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub interval_secs: u64,

    #[serde(default = "default_lookback_hours")]
    #[validate(range(min = 1, max = 8760))]
    pub lookback_hours: u64,

    #[serde(default = "default_batch_limit")]
    #[validate(range(min = 1, max = 100000))]
    pub batch_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DeliverySection {
    #[serde(default = "default_channel_capacity")]
    #[validate(range(min = 1))]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSection {
    /// Prometheus listen address; exporter disabled when unset
    #[serde(default)]
    pub listen: Option<SocketAddr>,
}

fn default_brokers() -> Vec<String> {
    vec!["localhost:9092".to_string()]
}
fn default_row_change_topic() -> String {
    "binlog".to_string()
}
fn default_marker_topic() -> String {
    "tx_info".to_string()
}
fn default_max_messages() -> usize {
    500
}
fn default_empty_poll_delay_ms() -> u64 {
    100
}
fn default_fetch_max_bytes() -> i32 {
    1_048_576
}
fn default_fetch_max_wait_ms() -> i32 {
    500
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_retry_initial_ms() -> u64 {
    100
}
fn default_retry_max_ms() -> u64 {
    10_000
}
fn default_store_url() -> String {
    "http://localhost:8123".to_string()
}
fn default_database() -> String {
    "audit".to_string()
}
fn default_user() -> String {
    "default".to_string()
}
fn default_true() -> bool {
    true
}
fn default_row_change_ttl_days() -> u32 {
    30
}
fn default_tx_info_ttl_days() -> u32 {
    60
}
fn default_connect_attempts() -> u32 {
    3
}
fn default_connect_retry_interval_secs() -> u64 {
    5
}
fn default_cursor_path() -> PathBuf {
    PathBuf::from("data/cursors.redb")
}
fn default_cursor_namespace() -> String {
    crate::cursor::DEFAULT_NAMESPACE.to_string()
}
fn default_batch_size() -> usize {
    512
}
fn default_batch_interval_ms() -> u64 {
    1000
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_interval_ms() -> u64 {
    1000
}
fn default_marker_channel_capacity() -> usize {
    500
}
fn default_sweep_interval_secs() -> u64 {
    10
}
fn default_lookback_hours() -> u64 {
    72
}
fn default_batch_limit() -> usize {
    1000
}
fn default_shutdown_timeout_secs() -> u64 {
    10
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            queue: QueueSection::default(),
            store: StoreSection::default(),
            cursor: CursorSection::default(),
            batch: BatchSection::default(),
            correlator: CorrelatorSection::default(),
            sweeper: SweeperSection::default(),
            delivery: DeliverySection::default(),
            filter: TableFilterConfig::default(),
            metrics: MetricsSection::default(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            row_change_topic: default_row_change_topic(),
            marker_topic: default_marker_topic(),
            start_offset: StartOffset::default(),
            max_messages: default_max_messages(),
            empty_poll_delay_ms: default_empty_poll_delay_ms(),
            fetch_max_bytes: default_fetch_max_bytes(),
            fetch_max_wait_ms: default_fetch_max_wait_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            database: default_database(),
            user: default_user(),
            password: None,
            compression: true,
            init_schema: true,
            row_change_ttl_days: default_row_change_ttl_days(),
            tx_info_ttl_days: default_tx_info_ttl_days(),
            connect_attempts: default_connect_attempts(),
            connect_retry_interval_secs: default_connect_retry_interval_secs(),
        }
    }
}

impl Default for CursorSection {
    fn default() -> Self {
        Self {
            path: default_cursor_path(),
            namespace: default_cursor_namespace(),
        }
    }
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            interval_ms: default_batch_interval_ms(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for CorrelatorSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            retry_interval_ms: default_retry_interval_ms(),
            channel_capacity: default_marker_channel_capacity(),
        }
    }
}

impl Default for SweeperSection {
    fn default() -> Self {
        Self {
            interval_secs: default_sweep_interval_secs(),
            lookback_hours: default_lookback_hours(),
            batch_limit: default_batch_limit(),
        }
    }
}

impl Default for DeliverySection {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl AuditConfig {
    /// Load, expand, parse and validate a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AuditError::config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: AuditConfig = serde_yaml::from_str(&expanded)
            .map_err(|e| AuditError::config(format!("Invalid YAML: {}", e)))?;
        config.validate_config()?;
        Ok(config)
    }

    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Field ranges plus cross-field rules.
    pub fn validate_config(&self) -> Result<()> {
        self.validate()
            .map_err(|e| AuditError::config(e.to_string()))?;

        if self.queue.row_change_topic == self.queue.marker_topic {
            return Err(AuditError::config(
                "row_change_topic and marker_topic must differ",
            ));
        }
        if self.queue.retry_initial_ms > self.queue.retry_max_ms {
            return Err(AuditError::config(
                "queue.retry_initial_ms must not exceed queue.retry_max_ms",
            ));
        }
        if self.cursor.namespace.is_empty() {
            return Err(AuditError::config("cursor.namespace must not be empty"));
        }
        TableFilter::new(&self.filter)?;
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            start_offset: self.queue.start_offset,
            max_messages: self.queue.max_messages,
            empty_poll_delay: Duration::from_millis(self.queue.empty_poll_delay_ms),
            retry_initial: Duration::from_millis(self.queue.retry_initial_ms),
            retry_max: Duration::from_millis(self.queue.retry_max_ms),
        }
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            row_change_topic: self.queue.row_change_topic.clone(),
            marker_topic: self.queue.marker_topic.clone(),
            feed: self.feed_config(),
            batch: BatchWriterConfig {
                batch_size: self.batch.size,
                flush_interval: Duration::from_millis(self.batch.interval_ms),
                channel_capacity: self.batch.channel_capacity,
            },
            correlator: CorrelatorConfig {
                max_attempts: self.correlator.max_attempts,
                retry_interval: Duration::from_millis(self.correlator.retry_interval_ms),
                channel_capacity: self.correlator.channel_capacity,
            },
            sweeper: SweeperConfig {
                interval: Duration::from_secs(self.sweeper.interval_secs),
                lookback: Duration::from_secs(self.sweeper.lookback_hours * 3600),
                batch_limit: self.sweeper.batch_limit,
            },
            delivery_capacity: self.delivery.channel_capacity,
            filter: self.filter.clone(),
        }
    }

    #[cfg(feature = "kafka")]
    pub fn kafka_config(&self) -> crate::queue::KafkaQueueConfig {
        crate::queue::KafkaQueueConfig {
            brokers: self.queue.brokers.clone(),
            connect_timeout: Duration::from_secs(self.queue.connect_timeout_secs),
            fetch_max_bytes: self.queue.fetch_max_bytes,
            fetch_max_wait: Duration::from_millis(self.queue.fetch_max_wait_ms as u64),
        }
    }

    #[cfg(feature = "clickhouse")]
    pub fn clickhouse_config(&self) -> crate::store::ClickHouseStoreConfig {
        crate::store::ClickHouseStoreConfig {
            url: self.store.url.clone(),
            database: self.store.database.clone(),
            user: self.store.user.clone(),
            password: self.store.password.clone().filter(|p| !p.is_empty()),
            compression: self.store.compression,
            init_schema: self.store.init_schema,
            row_change_ttl_days: self.store.row_change_ttl_days,
            tx_info_ttl_days: self.store.tx_info_ttl_days,
            connect_attempts: self.store.connect_attempts,
            connect_retry_interval: Duration::from_secs(self.store.connect_retry_interval_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = AuditConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config.queue.row_change_topic, "binlog");
        assert_eq!(config.queue.marker_topic, "tx_info");
        assert_eq!(config.queue.start_offset, StartOffset::Earliest);
        assert_eq!(config.batch.size, 512);
        assert_eq!(config.correlator.max_attempts, 3);
        assert_eq!(config.correlator.channel_capacity, 500);
        assert_eq!(config.sweeper.lookback_hours, 72);
        assert_eq!(config.sweeper.batch_limit, 1000);
        assert_eq!(config.cursor.namespace, "kafka");
        assert!(config.metrics.listen.is_none());

        let settings = config.pipeline_settings();
        assert_eq!(settings.batch.flush_interval, Duration::from_secs(1));
        assert_eq!(settings.correlator.retry_interval, Duration::from_secs(1));
        assert_eq!(settings.sweeper.interval, Duration::from_secs(10));
        assert_eq!(settings.sweeper.lookback, Duration::from_secs(72 * 3600));
        assert_eq!(settings.delivery_capacity, 1024);
    }

    #[test]
    fn test_section_defaults_match_field_defaults() {
        let config = AuditConfig::default();
        assert_eq!(config.batch.size, 512);
        assert_eq!(config.store.connect_attempts, 3);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(10));
        assert!(config.validate_config().is_ok());
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
queue:
  brokers: ["kafka-1:9092", "kafka-2:9092"]
  row_change_topic: audit.binlog
  marker_topic: audit.tx
  start_offset: latest
store:
  url: http://clickhouse:8123
  database: audit_log
  compression: false
cursor:
  path: /var/lib/rivven-audit/cursors.redb
batch:
  size: 256
  interval_ms: 500
sweeper:
  lookback_hours: 24
filter:
  include_tables: ["shop.*"]
  mask_columns: ["password"]
metrics:
  listen: 0.0.0.0:9100
"#;
        let config = AuditConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.queue.brokers.len(), 2);
        assert_eq!(config.queue.start_offset, StartOffset::Latest);
        assert!(!config.store.compression);
        assert_eq!(config.batch.size, 256);
        assert_eq!(config.filter.include_tables, vec!["shop.*".to_string()]);
        assert_eq!(
            config.metrics.listen,
            Some("0.0.0.0:9100".parse().unwrap())
        );
        assert_eq!(
            config.pipeline_settings().sweeper.lookback,
            Duration::from_secs(24 * 3600)
        );
    }

    #[test]
    fn test_rejects_out_of_range_values() {
        assert!(AuditConfig::from_yaml_str("batch:\n  size: 0\n").is_err());
        assert!(AuditConfig::from_yaml_str("correlator:\n  max_attempts: 0\n").is_err());
        assert!(AuditConfig::from_yaml_str("queue:\n  brokers: []\n").is_err());
    }

    #[test]
    fn test_rejects_same_topic_for_both_streams() {
        let yaml = "queue:\n  row_change_topic: x\n  marker_topic: x\n";
        let err = AuditConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("must differ"));
    }

    #[test]
    fn test_rejects_bad_yaml() {
        assert!(AuditConfig::from_yaml_str("queue: [").is_err());
    }

    #[test]
    #[serial]
    fn test_env_var_expansion() {
        std::env::set_var("RIVVEN_AUDIT_TEST_DB", "from_env");
        std::env::remove_var("RIVVEN_AUDIT_TEST_MISSING");

        let yaml = r#"
store:
  database: ${RIVVEN_AUDIT_TEST_DB}
  user: ${RIVVEN_AUDIT_TEST_MISSING:-fallback}
  password: ${RIVVEN_AUDIT_TEST_MISSING}
"#;
        let config = AuditConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.store.database, "from_env");
        assert_eq!(config.store.user, "fallback");
        assert!(config.store.password.is_none());

        std::env::remove_var("RIVVEN_AUDIT_TEST_DB");
    }

    #[test]
    fn test_password_is_redacted() {
        let config = AuditConfig::from_yaml_str("store:\n  password: hunter2\n").unwrap();
        let password = config.store.password.as_ref().unwrap();
        assert_eq!(password.expose_secret(), "hunter2");
        assert_eq!(format!("{:?}", password), "[REDACTED]");

        let dump = serde_yaml::to_string(&config).unwrap();
        assert!(!dump.contains("hunter2"));
        assert!(dump.contains("***REDACTED***"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("audit.yaml");
        std::fs::write(&path, "sweeper:\n  interval_secs: 30\n").unwrap();
        let config = AuditConfig::from_file(&path).unwrap();
        assert_eq!(config.sweeper.interval_secs, 30);

        assert!(AuditConfig::from_file(&dir.path().join("missing.yaml")).is_err());
    }
}
