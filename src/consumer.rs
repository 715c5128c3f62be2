//! Audit consumers — where reconciled records are delivered
//!
//! The coordinator hands every non-empty batch to an `AuditConsumer` exactly
//! once. Delivery failures are logged by the coordinator and never retried;
//! a consumer that needs durability must provide it itself.

use crate::error::Result;
use crate::record::AuditRecordAfterSave;
use crate::types::{TransactionEvent, TransactionStatus};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Sink for audit records
#[async_trait]
pub trait AuditConsumer<P: Send + Sync + 'static>: Send + Sync {
    /// Deliver one batch of records
    ///
    /// Never called with an empty batch.
    async fn consume(
        &self,
        records: &[AuditRecordAfterSave<P>],
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Called while the ambient transaction is still open, with the records
    /// batched for it so far
    ///
    /// Default implementation does nothing. Records passed here are still
    /// delivered through `consume` once the transaction commits.
    async fn before_transaction_commit(
        &self,
        _records: &[AuditRecordAfterSave<P>],
        _event: &TransactionEvent,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    /// Called once the ambient transaction has ended
    ///
    /// Default implementation does nothing.
    async fn transaction_finished(
        &self,
        _event: &TransactionEvent,
        _status: TransactionStatus,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }
}

/// In-memory consumer for testing and single-process use
///
/// Keeps every delivered batch, plus the transaction hooks it observed.
pub struct MemoryConsumer<P> {
    batches: Arc<RwLock<Vec<Vec<AuditRecordAfterSave<P>>>>>,
    pre_commit: Arc<RwLock<Vec<usize>>>,
    outcomes: Arc<RwLock<Vec<(TransactionEvent, TransactionStatus)>>>,
}

impl<P: Clone> MemoryConsumer<P> {
    pub fn new() -> Self {
        Self {
            batches: Arc::new(RwLock::new(Vec::new())),
            pre_commit: Arc::new(RwLock::new(Vec::new())),
            outcomes: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Delivered batches, oldest first
    pub async fn batches(&self) -> Vec<Vec<AuditRecordAfterSave<P>>> {
        self.batches.read().await.clone()
    }

    /// Every delivered record, in delivery order
    pub async fn records(&self) -> Vec<AuditRecordAfterSave<P>> {
        self.batches.read().await.iter().flatten().cloned().collect()
    }

    /// Number of `consume` calls
    pub async fn batch_count(&self) -> usize {
        self.batches.read().await.len()
    }

    /// Batch sizes seen by `before_transaction_commit`
    pub async fn pre_commit_sizes(&self) -> Vec<usize> {
        self.pre_commit.read().await.clone()
    }

    /// Transaction outcomes seen by `transaction_finished`
    pub async fn transaction_outcomes(&self) -> Vec<(TransactionEvent, TransactionStatus)> {
        self.outcomes.read().await.clone()
    }
}

impl<P: Clone> Default for MemoryConsumer<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P: Clone + Send + Sync + 'static> AuditConsumer<P> for MemoryConsumer<P> {
    async fn consume(
        &self,
        records: &[AuditRecordAfterSave<P>],
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.batches.write().await.push(records.to_vec());
        Ok(())
    }

    async fn before_transaction_commit(
        &self,
        records: &[AuditRecordAfterSave<P>],
        _event: &TransactionEvent,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.pre_commit.write().await.push(records.len());
        Ok(())
    }

    async fn transaction_finished(
        &self,
        event: &TransactionEvent,
        status: TransactionStatus,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        self.outcomes.write().await.push((event.clone(), status));
        Ok(())
    }
}

/// Consumer that emits one structured log event per record
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingConsumer;

#[async_trait]
impl<P: Debug + Send + Sync + 'static> AuditConsumer<P> for TracingConsumer {
    async fn consume(
        &self,
        records: &[AuditRecordAfterSave<P>],
        _cancel: &CancellationToken,
    ) -> Result<()> {
        for record in records {
            tracing::info!(
                unique_id = %record.unique_id,
                action = %record.action,
                entity = %record.entity_name,
                entity_id = record.entity_id.as_deref().unwrap_or("-"),
                permission = ?record.required_read_permission,
                data = %record.data_json,
                "Audit record"
            );
        }
        Ok(())
    }

    async fn transaction_finished(
        &self,
        event: &TransactionEvent,
        status: TransactionStatus,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        tracing::debug!(
            context_id = %event.context_id,
            status = ?status,
            "Audited transaction finished"
        );
        Ok(())
    }
}
