//! Persistence context collaborators
//!
//! The coordinator never talks to a storage engine directly. A host adapts
//! its ORM or change tracker to these traits: `ChangeSource` reports pending
//! changes and resolves primary keys, `TransactionControl` opens and settles
//! transactions. `UnitOfWork` is the combination the coordinator consumes.

use crate::error::Result;
use crate::types::{EntityRef, EntityState, TransactionId};
use crate::value::FieldValue;
use async_trait::async_trait;

pub mod memory;

/// One property of a tracked entity
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyEntry {
    pub name: String,

    /// Current value
    pub value: FieldValue,

    /// Whether the value changed in this unit of work
    pub is_modified: bool,

    /// Whether the property is (part of) the primary key
    pub is_primary_key: bool,
}

impl PropertyEntry {
    pub fn new(name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            is_modified: false,
            is_primary_key: false,
        }
    }

    pub fn modified(mut self) -> Self {
        self.is_modified = true;
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.is_primary_key = true;
        self
    }
}

/// One entity in the change snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntry {
    pub entity: EntityRef,

    /// Entity type tag, matched against registered rules
    pub entity_type: String,

    pub state: EntityState,

    pub properties: Vec<PropertyEntry>,
}

/// Snapshot of pending changes for one unit of work
pub trait ChangeSource: Send + Sync {
    /// Identifier of the unit of work (request id, context id, ...)
    fn context_id(&self) -> &str;

    /// Every entity the context currently tracks
    fn entries(&self) -> Vec<TrackedEntry>;

    /// Current primary key value of a tracked entity
    ///
    /// Returns `None` once the entity is no longer tracked, e.g. after a
    /// deleted row has been written.
    fn primary_key(&self, entity: EntityRef) -> Option<FieldValue>;
}

/// Transaction control on the persistence context
#[async_trait]
pub trait TransactionControl: Send + Sync {
    /// Transaction currently open on the context, if any
    fn current_transaction(&self) -> Option<TransactionId>;

    async fn begin_transaction(&self) -> Result<TransactionId>;

    async fn commit_transaction(&self, transaction: TransactionId) -> Result<()>;

    async fn rollback_transaction(&self, transaction: TransactionId) -> Result<()>;
}

/// A persistence context the coordinator can audit
pub trait UnitOfWork: ChangeSource + TransactionControl {}

impl<T: ChangeSource + TransactionControl + ?Sized> UnitOfWork for T {}
