//! In-memory unit of work
//!
//! A small change tracker with transaction control, for tests and
//! single-process hosts. `flush()` plays the physical write: added rows get
//! a generated integer key, deleted rows stop being tracked.

use super::{ChangeSource, PropertyEntry, TrackedEntry, TransactionControl};
use crate::error::{AuditError, Result};
use crate::types::{EntityRef, EntityState, TransactionId};
use crate::value::FieldValue;
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Name of the key property every in-memory entity carries
pub const KEY_PROPERTY: &str = "Id";

/// Counters for transaction activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionStats {
    pub begun: usize,
    pub committed: usize,
    pub rolled_back: usize,
}

struct MemoryEntity {
    entity: EntityRef,
    entity_type: String,
    state: EntityState,
    key: FieldValue,
    properties: Vec<PropertyEntry>,
}

#[derive(Default)]
struct MemoryState {
    entities: Vec<MemoryEntity>,
    next_ref: u64,
    next_key: i64,
    transaction: Option<TransactionId>,
    fail_next_commit: bool,
    fail_next_rollback: bool,
    stats: TransactionStats,
}

/// In-memory persistence context
pub struct MemoryUnitOfWork {
    context_id: String,
    state: Mutex<MemoryState>,
}

impl MemoryUnitOfWork {
    pub fn new(context_id: impl Into<String>) -> Self {
        Self {
            context_id: context_id.into(),
            state: Mutex::new(MemoryState {
                next_ref: 1,
                next_key: 1,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(
        &self,
        entity_type: &str,
        state: EntityState,
        key: FieldValue,
        properties: Vec<(String, FieldValue)>,
    ) -> EntityRef {
        let mut inner = self.lock();
        let entity = EntityRef(inner.next_ref);
        inner.next_ref += 1;
        let added = state == EntityState::Added;
        inner.entities.push(MemoryEntity {
            entity,
            entity_type: entity_type.to_string(),
            state,
            key,
            properties: properties
                .into_iter()
                .map(|(name, value)| PropertyEntry {
                    name,
                    value,
                    is_modified: added,
                    is_primary_key: false,
                })
                .collect(),
        });
        entity
    }

    /// Track a new entity; its key is assigned by the next `flush()`
    pub fn add<K, V>(&self, entity_type: &str, properties: impl IntoIterator<Item = (K, V)>) -> EntityRef
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let properties = properties
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.track(entity_type, EntityState::Added, FieldValue::Null, properties)
    }

    /// Track an existing, unchanged row
    pub fn attach<K, V>(
        &self,
        entity_type: &str,
        key: impl Into<FieldValue>,
        properties: impl IntoIterator<Item = (K, V)>,
    ) -> EntityRef
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        let properties = properties
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.track(entity_type, EntityState::Unchanged, key.into(), properties)
    }

    /// Change a property value; returns false if the entity is not tracked
    pub fn set(&self, entity: EntityRef, name: &str, value: impl Into<FieldValue>) -> bool {
        let mut inner = self.lock();
        let Some(tracked) = inner.entities.iter_mut().find(|e| e.entity == entity) else {
            return false;
        };

        let value = value.into();
        match tracked.properties.iter_mut().find(|p| p.name == name) {
            Some(prop) => {
                prop.value = value;
                prop.is_modified = true;
            }
            None => tracked
                .properties
                .push(PropertyEntry::new(name, value).modified()),
        }
        if tracked.state == EntityState::Unchanged {
            tracked.state = EntityState::Modified;
        }
        true
    }

    /// Mark an entity for deletion; an entity added in this unit of work is simply dropped
    pub fn remove(&self, entity: EntityRef) -> bool {
        let mut inner = self.lock();
        let Some(index) = inner.entities.iter().position(|e| e.entity == entity) else {
            return false;
        };
        if inner.entities[index].state == EntityState::Added {
            inner.entities.remove(index);
        } else {
            inner.entities[index].state = EntityState::Deleted;
        }
        true
    }

    /// Force a lifecycle state, bypassing the usual transitions
    pub fn set_state(&self, entity: EntityRef, state: EntityState) -> bool {
        let mut inner = self.lock();
        match inner.entities.iter_mut().find(|e| e.entity == entity) {
            Some(tracked) => {
                tracked.state = state;
                true
            }
            None => false,
        }
    }

    /// Perform the physical write; returns the number of rows written
    pub fn flush(&self) -> usize {
        let mut inner = self.lock();
        let mut next_key = inner.next_key;
        let mut written = 0;

        inner.entities.retain(|e| {
            if e.state == EntityState::Deleted {
                written += 1;
                false
            } else {
                true
            }
        });

        for tracked in inner.entities.iter_mut() {
            match tracked.state {
                EntityState::Added => {
                    tracked.key = FieldValue::Int(next_key);
                    next_key += 1;
                }
                EntityState::Modified => {}
                _ => continue,
            }
            tracked.state = EntityState::Unchanged;
            tracked.properties.iter_mut().for_each(|p| p.is_modified = false);
            written += 1;
        }

        inner.next_key = next_key;
        written
    }

    /// Make the next commit fail (the transaction stays open)
    pub fn fail_next_commit(&self) {
        self.lock().fail_next_commit = true;
    }

    /// Make the next rollback fail (the transaction is still discarded)
    pub fn fail_next_rollback(&self) {
        self.lock().fail_next_rollback = true;
    }

    pub fn stats(&self) -> TransactionStats {
        self.lock().stats
    }
}

impl ChangeSource for MemoryUnitOfWork {
    fn context_id(&self) -> &str {
        &self.context_id
    }

    fn entries(&self) -> Vec<TrackedEntry> {
        self.lock()
            .entities
            .iter()
            .map(|e| {
                let mut properties = Vec::with_capacity(e.properties.len() + 1);
                properties.push(PropertyEntry::new(KEY_PROPERTY, e.key.clone()).primary_key());
                properties.extend(e.properties.iter().cloned());
                TrackedEntry {
                    entity: e.entity,
                    entity_type: e.entity_type.clone(),
                    state: e.state,
                    properties,
                }
            })
            .collect()
    }

    fn primary_key(&self, entity: EntityRef) -> Option<FieldValue> {
        self.lock()
            .entities
            .iter()
            .find(|e| e.entity == entity)
            .map(|e| e.key.clone())
    }
}

#[async_trait]
impl TransactionControl for MemoryUnitOfWork {
    fn current_transaction(&self) -> Option<TransactionId> {
        self.lock().transaction
    }

    async fn begin_transaction(&self) -> Result<TransactionId> {
        let mut inner = self.lock();
        if let Some(open) = inner.transaction {
            return Err(AuditError::Transaction(format!(
                "Transaction {} is already open",
                open
            )));
        }
        let transaction = TransactionId::new();
        inner.transaction = Some(transaction);
        inner.stats.begun += 1;
        Ok(transaction)
    }

    async fn commit_transaction(&self, transaction: TransactionId) -> Result<()> {
        let mut inner = self.lock();
        if inner.transaction != Some(transaction) {
            return Err(AuditError::Transaction(format!(
                "Transaction {} is not open",
                transaction
            )));
        }
        if std::mem::take(&mut inner.fail_next_commit) {
            return Err(AuditError::Transaction(format!(
                "Commit of {} failed",
                transaction
            )));
        }
        inner.transaction = None;
        inner.stats.committed += 1;
        Ok(())
    }

    async fn rollback_transaction(&self, transaction: TransactionId) -> Result<()> {
        let mut inner = self.lock();
        if inner.transaction != Some(transaction) {
            return Err(AuditError::Transaction(format!(
                "Transaction {} is not open",
                transaction
            )));
        }
        inner.transaction = None;
        if std::mem::take(&mut inner.fail_next_rollback) {
            return Err(AuditError::Transaction(format!(
                "Rollback of {} failed",
                transaction
            )));
        }
        inner.stats.rolled_back += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(uow: &MemoryUnitOfWork, entity: EntityRef) -> TrackedEntry {
        uow.entries()
            .into_iter()
            .find(|e| e.entity == entity)
            .unwrap()
    }

    #[test]
    fn test_add_then_flush_assigns_key() {
        let uow = MemoryUnitOfWork::new("req-1");
        let order = uow.add("Order", [("Total", 10.0)]);

        assert_eq!(uow.primary_key(order), Some(FieldValue::Null));
        assert_eq!(entry(&uow, order).state, EntityState::Added);

        assert_eq!(uow.flush(), 1);
        assert_eq!(uow.primary_key(order), Some(FieldValue::Int(1)));
        assert_eq!(entry(&uow, order).state, EntityState::Unchanged);
    }

    #[test]
    fn test_entries_expose_key_property() {
        let uow = MemoryUnitOfWork::new("req-1");
        let order = uow.attach("Order", 7, [("Total", 10.0)]);
        let props = entry(&uow, order).properties;
        assert!(props[0].is_primary_key);
        assert_eq!(props[0].name, KEY_PROPERTY);
        assert_eq!(props[0].value, FieldValue::Int(7));
        assert!(!props[1].is_modified);
    }

    #[test]
    fn test_set_marks_modified() {
        let uow = MemoryUnitOfWork::new("req-1");
        let order = uow.attach("Order", 7, [("Total", 10.0), ("Note", 0.0)]);
        assert!(uow.set(order, "Total", 12.5));

        let tracked = entry(&uow, order);
        assert_eq!(tracked.state, EntityState::Modified);
        let total = tracked.properties.iter().find(|p| p.name == "Total").unwrap();
        assert!(total.is_modified);
        assert_eq!(total.value, FieldValue::Float(12.5));
        let note = tracked.properties.iter().find(|p| p.name == "Note").unwrap();
        assert!(!note.is_modified);
    }

    #[test]
    fn test_deleted_row_loses_key_after_flush() {
        let uow = MemoryUnitOfWork::new("req-1");
        let order = uow.attach("Order", 7, Vec::<(String, FieldValue)>::new());
        assert!(uow.remove(order));
        assert_eq!(uow.primary_key(order), Some(FieldValue::Int(7)));

        uow.flush();
        assert_eq!(uow.primary_key(order), None);
    }

    #[test]
    fn test_remove_added_entity_untracks_it() {
        let uow = MemoryUnitOfWork::new("req-1");
        let order = uow.add("Order", [("Total", 1)]);
        assert!(uow.remove(order));
        assert!(uow.entries().is_empty());
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let uow = MemoryUnitOfWork::new("req-1");
        let tx = uow.begin_transaction().await.unwrap();
        assert_eq!(uow.current_transaction(), Some(tx));
        assert!(uow.begin_transaction().await.is_err());

        uow.commit_transaction(tx).await.unwrap();
        assert_eq!(uow.current_transaction(), None);
        assert!(uow.commit_transaction(tx).await.is_err());

        assert_eq!(
            uow.stats(),
            TransactionStats {
                begun: 1,
                committed: 1,
                rolled_back: 0
            }
        );
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_transaction_open() {
        let uow = MemoryUnitOfWork::new("req-1");
        let tx = uow.begin_transaction().await.unwrap();
        uow.fail_next_commit();

        assert!(uow.commit_transaction(tx).await.is_err());
        assert_eq!(uow.current_transaction(), Some(tx));

        uow.rollback_transaction(tx).await.unwrap();
        assert_eq!(uow.current_transaction(), None);
        assert_eq!(uow.stats().rolled_back, 1);
    }
}
