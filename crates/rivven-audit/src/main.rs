//! rivven-audit - Transaction audit correlation service
//!
//! Consumes CDC row changes and transaction markers from Kafka, stores row
//! changes in ClickHouse, and emits one audit record per committed
//! transaction.
//!
//! # Usage
//!
//! ```bash
//! # Run the pipeline
//! rivven-audit -c audit.yaml
//!
//! # Validate configuration
//! rivven-audit -c audit.yaml validate
//!
//! # Create ClickHouse tables and exit
//! rivven-audit -c audit.yaml init-schema
//!
//! # Inspect or move consumer cursors (pipeline must be stopped)
//! rivven-audit -c audit.yaml cursors
//! rivven-audit -c audit.yaml set-cursor binlog 0 1200
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rivven_audit::cursor::{CursorStore, RedbCursorStore};
use rivven_audit::handler::LoggingAuditHandler;
use rivven_audit::metrics::{init_metrics, AuditMetrics};
use rivven_audit::pipeline::AuditPipeline;
use rivven_audit::queue::KafkaQueue;
use rivven_audit::store::ClickHouseStore;
use rivven_audit::AuditConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "rivven-audit")]
#[command(version, about = "Transaction audit correlation for CDC streams")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "audit.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the correlation pipeline (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Create the ClickHouse database and tables, then exit
    InitSchema,
    /// List stored consumer cursors
    Cursors,
    /// Overwrite the next offset for one partition
    SetCursor {
        topic: String,
        partition: i32,
        /// Next offset to read
        offset: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = AuditConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Validate => validate(&config),
        Commands::InitSchema => init_schema(config).await,
        Commands::Cursors => list_cursors(&config),
        Commands::SetCursor {
            topic,
            partition,
            offset,
        } => set_cursor(&config, &topic, partition, offset),
    }
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn run(config: AuditConfig) -> Result<()> {
    info!("Starting rivven-audit");

    if let Some(addr) = config.metrics.listen {
        init_metrics(addr).context("Failed to start metrics exporter")?;
    }

    let store = ClickHouseStore::connect(config.clickhouse_config())
        .await
        .context("ClickHouse unavailable")?;
    let queue = KafkaQueue::connect(config.kafka_config())
        .await
        .context("Kafka unavailable")?;
    let cursors = open_cursors(&config)?;

    let metrics = Arc::new(AuditMetrics::new());
    let running = AuditPipeline::new(
        config.pipeline_settings(),
        Arc::new(queue),
        Arc::new(store),
        Arc::new(cursors),
        Arc::new(LoggingAuditHandler),
    )
    .with_metrics(metrics.clone())
    .start()
    .await
    .context("Failed to start pipeline")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let result = running.shutdown(config.shutdown_timeout()).await;
    let snapshot = metrics.snapshot();
    info!(
        rows_flushed = snapshot.rows_flushed,
        markers_resolved = snapshot.markers_resolved,
        markers_deferred = snapshot.markers_deferred,
        sweep_resolved = snapshot.sweep_resolved,
        records_delivered = snapshot.records_delivered,
        "rivven-audit stopped"
    );
    if let Err(e) = result {
        warn!("Unclean shutdown: {}", e);
        return Err(e.into());
    }
    Ok(())
}

fn validate(config: &AuditConfig) -> Result<()> {
    println!("✓ Configuration is valid");
    println!();
    println!("Queue:");
    println!("  brokers:          {}", config.queue.brokers.join(", "));
    println!("  row-change topic: {}", config.queue.row_change_topic);
    println!("  marker topic:     {}", config.queue.marker_topic);
    println!("  start offset:     {:?}", config.queue.start_offset);
    println!("Store:");
    println!("  url:              {}", config.store.url);
    println!("  database:         {}", config.store.database);
    println!("Cursors:");
    println!(
        "  {} (namespace {})",
        config.cursor.path.display(),
        config.cursor.namespace
    );
    println!("Correlation:");
    println!(
        "  {} attempts, {}ms apart; sweep every {}s over {}h",
        config.correlator.max_attempts,
        config.correlator.retry_interval_ms,
        config.sweeper.interval_secs,
        config.sweeper.lookback_hours
    );
    Ok(())
}

async fn init_schema(mut config: AuditConfig) -> Result<()> {
    config.store.init_schema = true;
    ClickHouseStore::connect(config.clickhouse_config())
        .await
        .context("Failed to initialize schema")?;
    println!(
        "✓ Schema ready in database '{}'",
        config.store.database
    );
    Ok(())
}

fn open_cursors(config: &AuditConfig) -> Result<RedbCursorStore> {
    RedbCursorStore::open(&config.cursor.path, config.cursor.namespace.clone()).with_context(
        || format!("Failed to open cursor store {}", config.cursor.path.display()),
    )
}

fn list_cursors(config: &AuditConfig) -> Result<()> {
    let cursors = open_cursors(config)?.list()?;
    if cursors.is_empty() {
        println!("No cursors stored in namespace '{}'", config.cursor.namespace);
        return Ok(());
    }

    println!("{:<30} {:>10} {:>15}", "TOPIC", "PARTITION", "NEXT OFFSET");
    for cursor in cursors {
        println!(
            "{:<30} {:>10} {:>15}",
            cursor.topic, cursor.partition, cursor.offset
        );
    }
    Ok(())
}

fn set_cursor(config: &AuditConfig, topic: &str, partition: i32, offset: i64) -> Result<()> {
    anyhow::ensure!(offset >= 0, "offset must not be negative");
    let store = open_cursors(config)?;
    let previous = store.get(topic, partition)?;
    store.put(topic, partition, offset)?;
    println!(
        "✓ {}/{}: {} -> {}",
        topic,
        partition,
        previous.map_or_else(|| "unset".to_string(), |o| o.to_string()),
        offset
    );
    Ok(())
}
