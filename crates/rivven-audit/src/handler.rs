//! Downstream delivery of correlated audit records
//!
//! The correlator and the sweeper enqueue records on a bounded channel; a
//! single [`AuditDispatcher`] task invokes the configured [`AuditHandler`]
//! for each one. Handler failures are logged and counted, never retried:
//! a handler that needs durability must provide it itself, and must tolerate
//! seeing the same GTID more than once.

use crate::error::Result;
use crate::event::CorrelatedAuditRecord;
use crate::metrics::AuditMetrics;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Sender side of the delivery channel.
pub type AuditSender = mpsc::Sender<CorrelatedAuditRecord>;

/// Consumer of correlated audit records.
#[async_trait]
pub trait AuditHandler: Send + Sync {
    async fn on_audit_record(&self, record: &CorrelatedAuditRecord) -> Result<()>;
}

/// Writes every record as JSON to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAuditHandler;

#[async_trait]
impl AuditHandler for LoggingAuditHandler {
    async fn on_audit_record(&self, record: &CorrelatedAuditRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        info!(
            target: "rivven_audit::record",
            gtid = %record.gtid,
            changes = record.row_changes.len(),
            "{}", json
        );
        Ok(())
    }
}

/// Adapts a synchronous closure.
pub struct FnAuditHandler<F> {
    f: F,
}

impl<F> FnAuditHandler<F>
where
    F: Fn(&CorrelatedAuditRecord) -> Result<()> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> AuditHandler for FnAuditHandler<F>
where
    F: Fn(&CorrelatedAuditRecord) -> Result<()> + Send + Sync,
{
    async fn on_audit_record(&self, record: &CorrelatedAuditRecord) -> Result<()> {
        (self.f)(record)
    }
}

pub struct AuditDispatcher {
    handler: Arc<dyn AuditHandler>,
    rx: mpsc::Receiver<CorrelatedAuditRecord>,
    metrics: Arc<AuditMetrics>,
}

impl AuditDispatcher {
    pub fn new(
        handler: Arc<dyn AuditHandler>,
        capacity: usize,
        metrics: Arc<AuditMetrics>,
    ) -> (Self, AuditSender) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                handler,
                rx,
                metrics,
            },
            tx,
        )
    }

    /// Deliver until every sender is dropped and the channel is drained.
    pub async fn run(mut self) {
        while let Some(record) = self.rx.recv().await {
            match self.handler.on_audit_record(&record).await {
                Ok(()) => self.metrics.record_delivery(true),
                Err(e) => {
                    self.metrics.record_delivery(false);
                    error!(
                        gtid = %record.gtid,
                        context = %record.context,
                        changes = record.row_changes.len(),
                        "Audit handler failed, record not retried: {}", e
                    );
                }
            }
        }
        info!("Audit dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuditError;
    use chrono::Utc;
    use std::sync::Mutex;

    fn record(gtid: &str) -> CorrelatedAuditRecord {
        CorrelatedAuditRecord::new(gtid, "ctx", Utc::now(), vec![])
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_in_order_and_counts_failures() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let handler = FnAuditHandler::new(move |r: &CorrelatedAuditRecord| {
            seen_clone.lock().unwrap().push(r.gtid.clone());
            if r.gtid == "bad" {
                return Err(AuditError::handler("downstream unavailable"));
            }
            Ok(())
        });

        let metrics = Arc::new(AuditMetrics::new());
        let (dispatcher, tx) = AuditDispatcher::new(Arc::new(handler), 8, metrics.clone());
        let task = tokio::spawn(dispatcher.run());

        for gtid in ["a", "bad", "b"] {
            tx.send(record(gtid)).await.unwrap();
        }
        drop(tx);
        task.await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a", "bad", "b"]);
        let snap = metrics.snapshot();
        assert_eq!(snap.records_delivered, 2);
        assert_eq!(snap.delivery_failures, 1);
    }

    #[tokio::test]
    async fn test_logging_handler() {
        assert!(LoggingAuditHandler
            .on_audit_record(&record("T1"))
            .await
            .is_ok());
    }
}
