//! In-memory columnar store
//!
//! Mirrors the storage semantics of the ClickHouse tables (append-only row
//! changes, replace-by-GTID transactions where the higher status wins) so the
//! pipeline can be embedded or tested without a server. Failures can be
//! injected per operation class.

use super::{group_by_gtid, ColumnarStore, StoredRowChange, StoredTransaction, TransactionStatus};
use crate::error::{AuditError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct MemoryColumnarStore {
    row_changes: RwLock<Vec<StoredRowChange>>,
    transactions: RwLock<HashMap<String, StoredTransaction>>,
    fail_inserts: AtomicBool,
    fail_queries: AtomicBool,
    fail_upserts: AtomicBool,
    insert_batches: AtomicU64,
    upsert_batches: AtomicU64,
}

impl MemoryColumnarStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `insert_row_changes` fail until reset.
    pub fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }

    /// Make every read query fail until reset.
    pub fn set_fail_queries(&self, fail: bool) {
        self.fail_queries.store(fail, Ordering::SeqCst);
    }

    /// Make transaction upserts fail until reset.
    pub fn set_fail_upserts(&self, fail: bool) {
        self.fail_upserts.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `insert_row_changes` calls.
    pub fn insert_batches(&self) -> u64 {
        self.insert_batches.load(Ordering::SeqCst)
    }

    /// Number of successful `upsert_transactions` calls.
    pub fn upsert_batches(&self) -> u64 {
        self.upsert_batches.load(Ordering::SeqCst)
    }

    pub async fn row_change_count(&self) -> usize {
        self.row_changes.read().await.len()
    }

    /// Snapshot of all stored transactions, ordered by GTID.
    pub async fn transactions(&self) -> Vec<StoredTransaction> {
        let mut txs: Vec<StoredTransaction> =
            self.transactions.read().await.values().cloned().collect();
        txs.sort_by(|a, b| a.gtid.cmp(&b.gtid));
        txs
    }

    fn check_queries(&self) -> Result<()> {
        if self.fail_queries.load(Ordering::SeqCst) {
            return Err(AuditError::store("injected query failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl ColumnarStore for MemoryColumnarStore {
    async fn ping(&self) -> Result<()> {
        self.check_queries()
    }

    async fn insert_row_changes(&self, rows: &[StoredRowChange]) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(AuditError::store("injected insert failure"));
        }
        self.row_changes.write().await.extend_from_slice(rows);
        self.insert_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn upsert_transactions(&self, txs: &[StoredTransaction]) -> Result<()> {
        if self.fail_upserts.load(Ordering::SeqCst) {
            return Err(AuditError::store("injected upsert failure"));
        }
        let mut table = self.transactions.write().await;
        for tx in txs {
            match table.get(&tx.gtid) {
                // processed never regresses
                Some(existing) if existing.status > tx.status => {}
                _ => {
                    table.insert(tx.gtid.clone(), tx.clone());
                }
            }
        }
        self.upsert_batches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_transaction(&self, gtid: &str) -> Result<Option<StoredTransaction>> {
        self.check_queries()?;
        Ok(self.transactions.read().await.get(gtid).cloned())
    }

    async fn list_row_changes(&self, gtid: &str) -> Result<Vec<StoredRowChange>> {
        self.check_queries()?;
        let mut rows: Vec<StoredRowChange> = self
            .row_changes
            .read()
            .await
            .iter()
            .filter(|r| r.gtid == gtid)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        Ok(rows)
    }

    async fn list_row_changes_for(
        &self,
        gtids: &[String],
    ) -> Result<HashMap<String, Vec<StoredRowChange>>> {
        self.check_queries()?;
        let rows = self.row_changes.read().await;
        Ok(group_by_gtid(
            rows.iter().filter(|r| gtids.contains(&r.gtid)).cloned(),
        ))
    }

    async fn list_unprocessed(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<StoredTransaction>> {
        self.check_queries()?;
        let mut txs: Vec<StoredTransaction> = self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| tx.status == TransactionStatus::Unprocessed && tx.commit_time >= since)
            .cloned()
            .collect();
        txs.sort_by(|a, b| b.commit_time.cmp(&a.commit_time));
        txs.truncate(limit);
        Ok(txs)
    }

    async fn count_unprocessed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.check_queries()?;
        Ok(self
            .transactions
            .read()
            .await
            .values()
            .filter(|tx| tx.status == TransactionStatus::Unprocessed && tx.commit_time < cutoff)
            .count() as u64)
    }
}
