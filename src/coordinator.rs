//! Audit lifecycle coordinator
//!
//! One coordinator serves one unit of work. The host forwards its
//! persistence notifications to it:
//!
//! - `start_collecting` before every physical flush attempt
//! - `finish_and_maybe_dispatch` after every successful flush
//! - `on_transaction_*` when the ambient transaction settles
//! - `on_save_changes_failed` / `on_save_changes_canceled` when a flush does not happen
//!
//! Records captured outside a transaction are delivered as soon as the flush
//! finishes. Records captured inside a transaction are batched and delivered
//! once, when it commits, or dropped when it rolls back.

use crate::consumer::AuditConsumer;
use crate::context::{TrackedEntry, UnitOfWork};
use crate::error::{AuditError, Result};
use crate::options::AuditTrailOptions;
use crate::record::{AuditRecordAfterSave, AuditRecordBeforeSave};
use crate::registry::{RuleKey, RuleRegistry};
use crate::rule::EntityRule;
use crate::types::{
    AuditAction, EntityState, TransactionEvent, TransactionId, TransactionStatus,
};
use crate::value::TrackedProperties;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Where the coordinator is in the capture/dispatch cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Idle,
    Capturing,
    AwaitingPhysicalWrite,
    Reconciling,
    ImmediateDispatch,
    Batching,
}

/// State of the ambient transaction as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionPhase {
    Inactive,
    Open,
    Committing,
    Committed,
    RolledBack,
    Failed,
}

/// A transaction the coordinator opened and must settle
struct OwnedTransaction {
    id: TransactionId,
    settled: bool,
}

impl OwnedTransaction {
    fn new(id: TransactionId) -> Self {
        Self { id, settled: false }
    }

    fn settle(mut self) -> TransactionId {
        self.settled = true;
        self.id
    }
}

impl Drop for OwnedTransaction {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                transaction = %self.id,
                "Auto-opened transaction released without commit or rollback"
            );
        }
    }
}

struct CoordinatorState<P> {
    phase: LifecyclePhase,
    transaction_phase: TransactionPhase,
    owned: Option<OwnedTransaction>,

    /// Last transaction this coordinator settled itself; host
    /// notifications for it are ignored
    settled: Option<TransactionId>,

    commit_in_progress: bool,
    pending_captures: Vec<AuditRecordBeforeSave<P>>,
    pending_batch: Vec<AuditRecordAfterSave<P>>,
}

impl<P> CoordinatorState<P> {
    fn new() -> Self {
        Self {
            phase: LifecyclePhase::Idle,
            transaction_phase: TransactionPhase::Inactive,
            owned: None,
            settled: None,
            commit_in_progress: false,
            pending_captures: Vec::new(),
            pending_batch: Vec::new(),
        }
    }

    /// Replace captures of entities seen again, keep their correlation id
    fn merge_captures(&mut self, captured: Vec<AuditRecordBeforeSave<P>>) {
        for mut record in captured {
            match self
                .pending_captures
                .iter_mut()
                .find(|pending| pending.entity == record.entity)
            {
                Some(pending) => {
                    record.unique_id = pending.unique_id;
                    *pending = record;
                }
                None => self.pending_captures.push(record),
            }
        }
    }
}

/// Orchestrates capture, reconciliation and delivery for one unit of work
pub struct AuditCoordinator<P: Send + Sync + 'static> {
    registry: Arc<RuleRegistry<P>>,
    consumer: Arc<dyn AuditConsumer<P>>,
    options: AuditTrailOptions,
    scope: Option<String>,
    state: Mutex<CoordinatorState<P>>,
}

impl<P> AuditCoordinator<P>
where
    P: Clone + Send + Sync + 'static,
{
    /// Create a coordinator with default options
    pub fn new(registry: Arc<RuleRegistry<P>>, consumer: Arc<dyn AuditConsumer<P>>) -> Self {
        Self::builder(registry, consumer).build()
    }

    pub fn builder(
        registry: Arc<RuleRegistry<P>>,
        consumer: Arc<dyn AuditConsumer<P>>,
    ) -> AuditCoordinatorBuilder<P> {
        AuditCoordinatorBuilder {
            registry,
            consumer,
            options: AuditTrailOptions::default(),
            scope: None,
        }
    }

    pub fn options(&self) -> &AuditTrailOptions {
        &self.options
    }

    /// Scope tag used to resolve entity rules
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub async fn phase(&self) -> LifecyclePhase {
        self.state.lock().await.phase
    }

    pub async fn transaction_phase(&self) -> TransactionPhase {
        self.state.lock().await.transaction_phase
    }

    /// Number of records captured and waiting for the physical write
    pub async fn pending_capture_count(&self) -> usize {
        self.state.lock().await.pending_captures.len()
    }

    /// Number of reconciled records waiting for the transaction outcome
    pub async fn pending_batch_len(&self) -> usize {
        self.state.lock().await.pending_batch.len()
    }

    /// Capture pending changes before a physical flush
    ///
    /// Opens a transaction first when `auto_open_transaction` is set and none
    /// is open. Repeating the call for the same unit of work replaces earlier
    /// captures instead of duplicating them. Fatal rule errors propagate and
    /// leave the pending captures as they were.
    pub async fn start_collecting(
        &self,
        context: &dyn UnitOfWork,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }

        {
            let mut state = self.state.lock().await;
            if state.commit_in_progress {
                tracing::debug!(
                    context_id = %context.context_id(),
                    "Capture skipped while committing"
                );
                return Ok(());
            }
            state.phase = LifecyclePhase::Capturing;
        }

        match context.current_transaction() {
            Some(_) => {
                let mut state = self.state.lock().await;
                if state.transaction_phase != TransactionPhase::Committing {
                    state.transaction_phase = TransactionPhase::Open;
                }
            }
            None if self.options.auto_open_transaction => {
                let opened = context.begin_transaction().await;
                let transaction = match opened {
                    Ok(transaction) => transaction,
                    Err(e) => {
                        self.state.lock().await.phase = LifecyclePhase::Idle;
                        return Err(e);
                    }
                };
                tracing::debug!(
                    context_id = %context.context_id(),
                    transaction = %transaction,
                    "Transaction auto-opened"
                );
                {
                    let mut state = self.state.lock().await;
                    state.owned = Some(OwnedTransaction::new(transaction));
                    state.transaction_phase = TransactionPhase::Open;
                }
                if cancel.is_cancelled() {
                    self.release_owned(context, cancel).await;
                    self.state.lock().await.phase = LifecyclePhase::Idle;
                    return Err(AuditError::Cancelled);
                }
            }
            None => {}
        }

        let captured = match self.capture(context) {
            Ok(captured) => captured,
            Err(e) => {
                self.state.lock().await.phase = LifecyclePhase::Idle;
                return Err(e);
            }
        };

        let mut state = self.state.lock().await;
        let count = captured.len();
        state.merge_captures(captured);
        state.phase = LifecyclePhase::AwaitingPhysicalWrite;
        tracing::debug!(
            context_id = %context.context_id(),
            captured = count,
            pending = state.pending_captures.len(),
            "Changes captured"
        );
        Ok(())
    }

    /// Reconcile captures after a physical flush and deliver or batch them
    ///
    /// Outside a transaction the records are delivered now. Inside one they
    /// join the transaction batch; if the coordinator opened that transaction
    /// it commits it here.
    pub async fn finish_and_maybe_dispatch(
        &self,
        context: &dyn UnitOfWork,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }

        let captures = {
            let mut state = self.state.lock().await;
            if state.commit_in_progress {
                tracing::debug!(
                    context_id = %context.context_id(),
                    "Finish skipped while committing"
                );
                return Ok(());
            }
            state.phase = LifecyclePhase::Reconciling;
            std::mem::take(&mut state.pending_captures)
        };

        let records: Vec<AuditRecordAfterSave<P>> = captures
            .into_iter()
            .map(|record| {
                let resolved = match record.action {
                    AuditAction::Create => context
                        .primary_key(record.entity)
                        .and_then(|key| key.as_key()),
                    AuditAction::Update | AuditAction::Delete => None,
                };
                record.into_after_save(resolved)
            })
            .collect();

        let Some(transaction) = context.current_transaction() else {
            {
                let mut state = self.state.lock().await;
                state.phase = LifecyclePhase::ImmediateDispatch;
                let stale = state.pending_batch.len();
                if stale > 0 {
                    tracing::warn!(
                        context_id = %context.context_id(),
                        dropped = stale,
                        "Transaction batch left without outcome, discarded"
                    );
                    state.pending_batch.clear();
                }
            }
            self.dispatch(records, cancel).await;
            self.state.lock().await.phase = LifecyclePhase::Idle;
            return Self::check_cancelled(cancel);
        };

        let owns_transaction = {
            let mut state = self.state.lock().await;
            state.phase = LifecyclePhase::Batching;
            state.pending_batch.extend(records);
            if state.transaction_phase == TransactionPhase::Inactive {
                state.transaction_phase = TransactionPhase::Open;
            }
            tracing::debug!(
                context_id = %context.context_id(),
                transaction = %transaction,
                batched = state.pending_batch.len(),
                "Records batched until commit"
            );
            state.owned.as_ref().map(|owned| owned.id) == Some(transaction)
        };

        if owns_transaction {
            self.commit_owned(context, transaction, cancel).await;
        }

        self.state.lock().await.phase = LifecyclePhase::Idle;
        Self::check_cancelled(cancel)
    }

    /// Run the consumer's pre-commit hook for a host-owned transaction
    pub async fn on_transaction_committing(
        &self,
        event: &TransactionEvent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }

        let batch = {
            let mut state = self.state.lock().await;
            if state.commit_in_progress {
                return Ok(());
            }
            state.transaction_phase = TransactionPhase::Committing;
            std::mem::take(&mut state.pending_batch)
        };

        if !batch.is_empty() {
            self.pre_commit_hook(&batch, event, cancel).await;
        }

        let mut state = self.state.lock().await;
        let appended = std::mem::replace(&mut state.pending_batch, batch);
        state.pending_batch.extend(appended);
        drop(state);

        Self::check_cancelled(cancel)
    }

    /// Deliver the transaction batch once the ambient transaction committed
    pub async fn on_transaction_committed(
        &self,
        event: &TransactionEvent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }

        let batch = {
            let mut state = self.state.lock().await;
            if Self::already_settled(&state, event) {
                return Ok(());
            }
            Self::settle_owned(&mut state, event);
            state.transaction_phase = TransactionPhase::Committed;
            std::mem::take(&mut state.pending_batch)
        };

        self.dispatch(batch, cancel).await;
        self.finished_hook(event, TransactionStatus::Committed, cancel)
            .await;
        Self::check_cancelled(cancel)
    }

    /// Drop the transaction batch after a rollback
    pub async fn on_transaction_rolled_back(
        &self,
        event: &TransactionEvent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.discard_batch(event, TransactionStatus::RolledBack, cancel)
            .await
    }

    /// Drop the transaction batch after a failed commit
    pub async fn on_transaction_failed(
        &self,
        event: &TransactionEvent,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.discard_batch(event, TransactionStatus::Failed, cancel)
            .await
    }

    /// Drop pending captures after the flush failed
    ///
    /// Rolls back the transaction the coordinator opened, if any.
    pub async fn on_save_changes_failed(
        &self,
        context: &dyn UnitOfWork,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.abandon_flush(context, "failed", cancel).await
    }

    /// Drop pending captures after the flush was canceled
    ///
    /// Rolls back the transaction the coordinator opened, if any.
    pub async fn on_save_changes_canceled(
        &self,
        context: &dyn UnitOfWork,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.abandon_flush(context, "canceled", cancel).await
    }

    pub async fn clear_pending_captures(&self) {
        let mut state = self.state.lock().await;
        state.pending_captures.clear();
    }

    pub async fn clear_pending_batch(&self) {
        let mut state = self.state.lock().await;
        state.pending_batch.clear();
    }

    fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            Err(AuditError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn resolve(&self, entity_type: &str) -> Result<Arc<dyn EntityRule<P>>> {
        self.registry.resolve_key(&RuleKey::for_permission::<P>(
            entity_type,
            self.scope.as_deref(),
        ))
    }

    /// Build before-save records for every audited change in the snapshot
    fn capture(&self, context: &dyn UnitOfWork) -> Result<Vec<AuditRecordBeforeSave<P>>> {
        let mut captured = Vec::new();
        for entry in context.entries() {
            if !self.registry.is_tracked(&entry.entity_type)
                || entry.state == EntityState::Unchanged
            {
                continue;
            }
            let action = AuditAction::from_state(entry.state, &entry.entity_type)?;
            let rule = self.resolve(&entry.entity_type)?;
            captured.push(self.capture_entry(context, rule.as_ref(), entry, action)?);
        }
        Ok(captured)
    }

    fn capture_entry(
        &self,
        context: &dyn UnitOfWork,
        rule: &dyn EntityRule<P>,
        entry: TrackedEntry,
        action: AuditAction,
    ) -> Result<AuditRecordBeforeSave<P>> {
        let mut modified_properties = TrackedProperties::new();
        for property in entry.properties {
            if property.is_primary_key {
                continue;
            }
            if action != AuditAction::Create && !property.is_modified {
                continue;
            }
            rule.execute_rules(&property.name, property.value, &mut modified_properties)?;
        }

        // Deleted rows may lose their key once written, so read it now
        let entity_id = match action {
            AuditAction::Create => None,
            AuditAction::Update | AuditAction::Delete => context
                .primary_key(entry.entity)
                .and_then(|key| key.as_key()),
        };

        let data_json = serde_json::to_string(&modified_properties)?;
        let entity_name = rule
            .display_name()
            .unwrap_or(&entry.entity_type)
            .to_string();

        Ok(AuditRecordBeforeSave {
            unique_id: Uuid::new_v4(),
            entity: entry.entity,
            action,
            entity_name,
            entity_id,
            modified_properties,
            data_json,
            required_read_permission: rule.permission().clone(),
            timestamp: Utc::now(),
        })
    }

    async fn dispatch(&self, records: Vec<AuditRecordAfterSave<P>>, cancel: &CancellationToken) {
        if records.is_empty() {
            return;
        }

        match self.consumer.consume(&records, cancel).await {
            Ok(()) => tracing::debug!(count = records.len(), "Audit records delivered"),
            Err(e) => tracing::error!(
                count = records.len(),
                error = %e,
                "Audit consumer failed, records dropped"
            ),
        }
    }

    async fn pre_commit_hook(
        &self,
        records: &[AuditRecordAfterSave<P>],
        event: &TransactionEvent,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = self
            .consumer
            .before_transaction_commit(records, event, cancel)
            .await
        {
            tracing::warn!(
                context_id = %event.context_id,
                error = %e,
                "Audit consumer pre-commit hook failed"
            );
        }
    }

    async fn finished_hook(
        &self,
        event: &TransactionEvent,
        status: TransactionStatus,
        cancel: &CancellationToken,
    ) {
        if let Err(e) = self
            .consumer
            .transaction_finished(event, status, cancel)
            .await
        {
            tracing::warn!(
                context_id = %event.context_id,
                status = ?status,
                error = %e,
                "Audit consumer transaction hook failed"
            );
        }
    }

    fn already_settled(state: &CoordinatorState<P>, event: &TransactionEvent) -> bool {
        match (state.settled, event.transaction) {
            (Some(settled), Some(transaction)) if settled == transaction => {
                tracing::debug!(
                    transaction = %transaction,
                    "Transaction already settled by coordinator"
                );
                true
            }
            _ => false,
        }
    }

    /// Forget an owned transaction the host settled for us
    fn settle_owned(state: &mut CoordinatorState<P>, event: &TransactionEvent) {
        let owned_matches = match (&state.owned, event.transaction) {
            (Some(owned), Some(transaction)) => owned.id == transaction,
            _ => false,
        };
        if owned_matches {
            if let Some(owned) = state.owned.take() {
                state.settled = Some(owned.settle());
            }
        }
    }

    async fn discard_batch(
        &self,
        event: &TransactionEvent,
        status: TransactionStatus,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }

        {
            let mut state = self.state.lock().await;
            if Self::already_settled(&state, event) {
                return Ok(());
            }
            Self::settle_owned(&mut state, event);
            state.transaction_phase = match status {
                TransactionStatus::Failed => TransactionPhase::Failed,
                _ => TransactionPhase::RolledBack,
            };
            let dropped = state.pending_batch.len();
            state.pending_batch.clear();
            tracing::debug!(
                context_id = %event.context_id,
                status = ?status,
                dropped,
                "Transaction batch discarded"
            );
        }

        self.finished_hook(event, status, cancel).await;
        Self::check_cancelled(cancel)
    }

    /// Commit the transaction the coordinator opened and deliver its batch
    ///
    /// A failed commit is rolled back and its batch dropped; neither failure
    /// escapes.
    async fn commit_owned(
        &self,
        context: &dyn UnitOfWork,
        transaction: TransactionId,
        cancel: &CancellationToken,
    ) {
        let event = TransactionEvent::new(context.context_id(), Some(transaction));
        let batch = {
            let mut state = self.state.lock().await;
            state.commit_in_progress = true;
            state.transaction_phase = TransactionPhase::Committing;
            std::mem::take(&mut state.pending_batch)
        };

        if !batch.is_empty() {
            self.pre_commit_hook(&batch, &event, cancel).await;
        }

        let committed = context.commit_transaction(transaction).await;

        // The commit is durable at this point, so its batch is delivered even
        // when the caller cancelled meanwhile
        let (status, settled_here) = match committed {
            Ok(()) => {
                tracing::debug!(transaction = %transaction, "Auto-opened transaction committed");
                let settled_here = self.finish_owned(TransactionPhase::Committed).await;
                self.dispatch(batch, cancel).await;
                (TransactionStatus::Committed, settled_here)
            }
            Err(e) => {
                tracing::warn!(
                    transaction = %transaction,
                    error = %e,
                    dropped = batch.len(),
                    "Auto-opened transaction commit failed, rolling back"
                );
                let phase = match context.rollback_transaction(transaction).await {
                    Ok(()) => TransactionPhase::RolledBack,
                    Err(e) => {
                        tracing::warn!(
                            transaction = %transaction,
                            error = %e,
                            "Rollback after failed commit failed"
                        );
                        TransactionPhase::Failed
                    }
                };
                (TransactionStatus::Failed, self.finish_owned(phase).await)
            }
        };

        // A host notification raised during the commit already ran the hook
        if settled_here {
            self.finished_hook(&event, status, cancel).await;
        }
    }

    /// Returns false when a host notification settled the transaction first
    async fn finish_owned(&self, phase: TransactionPhase) -> bool {
        let mut state = self.state.lock().await;
        state.commit_in_progress = false;
        match state.owned.take() {
            Some(owned) => {
                state.settled = Some(owned.settle());
                state.transaction_phase = phase;
                true
            }
            None => false,
        }
    }

    /// Roll back the owned transaction, logging failures
    async fn release_owned(&self, context: &dyn UnitOfWork, cancel: &CancellationToken) {
        let Some(owned) = self.state.lock().await.owned.take() else {
            return;
        };
        let transaction = owned.settle();

        let phase = match context.rollback_transaction(transaction).await {
            Ok(()) => {
                tracing::debug!(transaction = %transaction, "Auto-opened transaction rolled back");
                TransactionPhase::RolledBack
            }
            Err(e) => {
                tracing::warn!(
                    transaction = %transaction,
                    error = %e,
                    "Auto-opened transaction rollback failed"
                );
                TransactionPhase::Failed
            }
        };

        {
            let mut state = self.state.lock().await;
            state.settled = Some(transaction);
            state.transaction_phase = phase;
            state.pending_batch.clear();
        }

        let event = TransactionEvent::new(context.context_id(), Some(transaction));
        self.finished_hook(&event, TransactionStatus::RolledBack, cancel)
            .await;
    }

    async fn abandon_flush(
        &self,
        context: &dyn UnitOfWork,
        reason: &'static str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled);
        }

        {
            let mut state = self.state.lock().await;
            let dropped = state.pending_captures.len();
            state.pending_captures.clear();
            state.phase = LifecyclePhase::Idle;
            tracing::debug!(
                context_id = %context.context_id(),
                reason,
                dropped,
                "Pending captures discarded"
            );
        }

        self.release_owned(context, cancel).await;
        Self::check_cancelled(cancel)
    }
}

/// Builder for `AuditCoordinator`
pub struct AuditCoordinatorBuilder<P: Send + Sync + 'static> {
    registry: Arc<RuleRegistry<P>>,
    consumer: Arc<dyn AuditConsumer<P>>,
    options: AuditTrailOptions,
    scope: Option<String>,
}

impl<P> AuditCoordinatorBuilder<P>
where
    P: Clone + Send + Sync + 'static,
{
    pub fn options(mut self, options: AuditTrailOptions) -> Self {
        self.options = options;
        self
    }

    /// Resolve rules registered for this scope tag only
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn build(self) -> AuditCoordinator<P> {
        AuditCoordinator {
            registry: self.registry,
            consumer: self.consumer,
            options: self.options,
            scope: self.scope,
            state: Mutex::new(CoordinatorState::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::MemoryConsumer;
    use crate::context::memory::MemoryUnitOfWork;
    use crate::context::{ChangeSource, TrackedEntry, TransactionControl};
    use crate::rule::EntityRules;
    use crate::types::EntityRef;
    use crate::value::FieldValue;
    use async_trait::async_trait;

    #[derive(Debug, Clone, PartialEq)]
    enum Permission {
        Sales,
    }

    fn setup(
        options: AuditTrailOptions,
    ) -> (AuditCoordinator<Permission>, Arc<MemoryConsumer<Permission>>) {
        let mut registry = RuleRegistry::new();
        registry
            .register(EntityRules::builder("Order", Permission::Sales).build())
            .unwrap();
        let consumer = Arc::new(MemoryConsumer::<Permission>::new());
        let sink: Arc<dyn AuditConsumer<Permission>> = consumer.clone();
        let coordinator = AuditCoordinator::builder(Arc::new(registry), sink)
            .options(options)
            .build();
        (coordinator, consumer)
    }

    #[tokio::test]
    async fn test_phases_follow_flush() {
        let (coordinator, consumer) = setup(AuditTrailOptions::default());
        let uow = MemoryUnitOfWork::new("req-1");
        let cancel = CancellationToken::new();
        uow.add("Order", [("Total", 10.0)]);

        assert_eq!(coordinator.phase().await, LifecyclePhase::Idle);
        coordinator.start_collecting(&uow, &cancel).await.unwrap();
        assert_eq!(coordinator.phase().await, LifecyclePhase::AwaitingPhysicalWrite);
        assert_eq!(coordinator.pending_capture_count().await, 1);

        uow.flush();
        coordinator
            .finish_and_maybe_dispatch(&uow, &cancel)
            .await
            .unwrap();
        assert_eq!(coordinator.phase().await, LifecyclePhase::Idle);
        assert_eq!(coordinator.pending_capture_count().await, 0);
        assert_eq!(consumer.batch_count().await, 1);
    }

    #[tokio::test]
    async fn test_repeated_capture_keeps_one_record() {
        let (coordinator, _consumer) = setup(AuditTrailOptions::default());
        let uow = MemoryUnitOfWork::new("req-1");
        let cancel = CancellationToken::new();
        let order = uow.add("Order", [("Total", 10.0)]);

        coordinator.start_collecting(&uow, &cancel).await.unwrap();
        let first = coordinator.state.lock().await.pending_captures[0].unique_id;

        uow.set(order, "Total", 12.0);
        coordinator.start_collecting(&uow, &cancel).await.unwrap();

        let state = coordinator.state.lock().await;
        assert_eq!(state.pending_captures.len(), 1);
        assert_eq!(state.pending_captures[0].unique_id, first);
        assert_eq!(
            state.pending_captures[0].modified_properties["Total"],
            FieldValue::Float(12.0)
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_start_leaves_state() {
        let (coordinator, _consumer) = setup(AuditTrailOptions::default());
        let uow = MemoryUnitOfWork::new("req-1");
        uow.add("Order", [("Total", 10.0)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = coordinator.start_collecting(&uow, &cancel).await.unwrap_err();
        assert!(matches!(err, AuditError::Cancelled));
        assert_eq!(coordinator.pending_capture_count().await, 0);
        assert_eq!(coordinator.phase().await, LifecyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_host_transaction_batches_until_committed() {
        let (coordinator, consumer) = setup(AuditTrailOptions::default());
        let uow = MemoryUnitOfWork::new("req-1");
        let cancel = CancellationToken::new();
        let tx = uow.begin_transaction().await.unwrap();
        uow.add("Order", [("Total", 10.0)]);

        coordinator.start_collecting(&uow, &cancel).await.unwrap();
        assert_eq!(coordinator.transaction_phase().await, TransactionPhase::Open);
        uow.flush();
        coordinator
            .finish_and_maybe_dispatch(&uow, &cancel)
            .await
            .unwrap();
        assert_eq!(coordinator.pending_batch_len().await, 1);
        assert_eq!(consumer.batch_count().await, 0);

        let event = TransactionEvent::new("req-1", Some(tx));
        coordinator
            .on_transaction_committing(&event, &cancel)
            .await
            .unwrap();
        assert_eq!(consumer.pre_commit_sizes().await, vec![1]);
        assert_eq!(coordinator.pending_batch_len().await, 1);

        uow.commit_transaction(tx).await.unwrap();
        coordinator
            .on_transaction_committed(&event, &cancel)
            .await
            .unwrap();
        assert_eq!(consumer.batch_count().await, 1);
        assert_eq!(coordinator.pending_batch_len().await, 0);
        assert_eq!(
            coordinator.transaction_phase().await,
            TransactionPhase::Committed
        );
    }

    #[tokio::test]
    async fn test_failed_save_rolls_back_owned_transaction() {
        let (coordinator, consumer) =
            setup(AuditTrailOptions::new().with_auto_open_transaction(true));
        let uow = MemoryUnitOfWork::new("req-1");
        let cancel = CancellationToken::new();
        uow.add("Order", [("Total", 10.0)]);

        coordinator.start_collecting(&uow, &cancel).await.unwrap();
        assert!(uow.current_transaction().is_some());

        coordinator
            .on_save_changes_failed(&uow, &cancel)
            .await
            .unwrap();
        assert_eq!(uow.current_transaction(), None);
        assert_eq!(uow.stats().rolled_back, 1);
        assert_eq!(coordinator.pending_capture_count().await, 0);
        assert_eq!(
            coordinator.transaction_phase().await,
            TransactionPhase::RolledBack
        );
        assert_eq!(consumer.batch_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_notification_after_own_commit_is_noop() {
        let (coordinator, consumer) =
            setup(AuditTrailOptions::new().with_auto_open_transaction(true));
        let uow = MemoryUnitOfWork::new("req-1");
        let cancel = CancellationToken::new();
        uow.add("Order", [("Total", 10.0)]);

        coordinator.start_collecting(&uow, &cancel).await.unwrap();
        let tx = uow.current_transaction().unwrap();
        uow.flush();
        coordinator
            .finish_and_maybe_dispatch(&uow, &cancel)
            .await
            .unwrap();
        assert_eq!(consumer.batch_count().await, 1);

        let event = TransactionEvent::new("req-1", Some(tx));
        coordinator
            .on_transaction_committed(&event, &cancel)
            .await
            .unwrap();
        assert_eq!(consumer.batch_count().await, 1);
        assert_eq!(consumer.transaction_outcomes().await.len(), 1);
    }

    /// Unit of work whose transaction source reacts inside `commit_transaction`
    struct ReactiveUnitOfWork {
        inner: MemoryUnitOfWork,
        notify: Option<Arc<AuditCoordinator<Permission>>>,
        cancel_on_commit: Option<CancellationToken>,
    }

    impl ChangeSource for ReactiveUnitOfWork {
        fn context_id(&self) -> &str {
            self.inner.context_id()
        }

        fn entries(&self) -> Vec<TrackedEntry> {
            self.inner.entries()
        }

        fn primary_key(&self, entity: EntityRef) -> Option<FieldValue> {
            self.inner.primary_key(entity)
        }
    }

    #[async_trait]
    impl TransactionControl for ReactiveUnitOfWork {
        fn current_transaction(&self) -> Option<TransactionId> {
            self.inner.current_transaction()
        }

        async fn begin_transaction(&self) -> Result<TransactionId> {
            self.inner.begin_transaction().await
        }

        async fn commit_transaction(&self, transaction: TransactionId) -> Result<()> {
            self.inner.commit_transaction(transaction).await?;
            if let Some(cancel) = &self.cancel_on_commit {
                cancel.cancel();
            }
            if let Some(coordinator) = &self.notify {
                let event = TransactionEvent::new(self.inner.context_id(), Some(transaction));
                coordinator
                    .on_transaction_committed(&event, &CancellationToken::new())
                    .await?;
            }
            Ok(())
        }

        async fn rollback_transaction(&self, transaction: TransactionId) -> Result<()> {
            self.inner.rollback_transaction(transaction).await
        }
    }

    #[tokio::test]
    async fn test_create_capture_has_no_id_until_reconciled() {
        let (coordinator, consumer) = setup(AuditTrailOptions::default());
        let uow = MemoryUnitOfWork::new("req-1");
        let cancel = CancellationToken::new();
        uow.add("Order", [("Total", 10.0)]);

        coordinator.start_collecting(&uow, &cancel).await.unwrap();
        {
            let state = coordinator.state.lock().await;
            assert_eq!(state.pending_captures[0].action, AuditAction::Create);
            assert_eq!(state.pending_captures[0].entity_id, None);
        }

        uow.flush();
        coordinator
            .finish_and_maybe_dispatch(&uow, &cancel)
            .await
            .unwrap();
        assert_eq!(
            consumer.records().await[0].entity_id.as_deref(),
            Some("1")
        );
    }

    #[tokio::test]
    async fn test_commit_notification_during_own_commit_runs_hook_once() {
        let (coordinator, consumer) =
            setup(AuditTrailOptions::new().with_auto_open_transaction(true));
        let coordinator = Arc::new(coordinator);
        let uow = ReactiveUnitOfWork {
            inner: MemoryUnitOfWork::new("req-1"),
            notify: Some(coordinator.clone()),
            cancel_on_commit: None,
        };
        let cancel = CancellationToken::new();
        uow.inner.add("Order", [("Total", 10.0)]);

        coordinator.start_collecting(&uow, &cancel).await.unwrap();
        uow.inner.flush();
        coordinator
            .finish_and_maybe_dispatch(&uow, &cancel)
            .await
            .unwrap();

        assert_eq!(consumer.batch_count().await, 1);
        let outcomes = consumer.transaction_outcomes().await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].1, TransactionStatus::Committed);
        assert_eq!(
            coordinator.transaction_phase().await,
            TransactionPhase::Committed
        );
    }

    #[tokio::test]
    async fn test_cancel_during_own_commit_still_delivers() {
        let (coordinator, consumer) =
            setup(AuditTrailOptions::new().with_auto_open_transaction(true));
        let cancel = CancellationToken::new();
        let uow = ReactiveUnitOfWork {
            inner: MemoryUnitOfWork::new("req-1"),
            notify: None,
            cancel_on_commit: Some(cancel.clone()),
        };
        uow.inner.add("Order", [("Total", 10.0)]);

        coordinator.start_collecting(&uow, &cancel).await.unwrap();
        uow.inner.flush();
        let err = coordinator
            .finish_and_maybe_dispatch(&uow, &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, AuditError::Cancelled));
        assert_eq!(uow.inner.stats().committed, 1);
        assert_eq!(consumer.batch_count().await, 1);
        assert_eq!(coordinator.pending_batch_len().await, 0);
    }
}
