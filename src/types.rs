//! Core lifecycle types for the a3s-audit system
//!
//! All serialized types use camelCase JSON for wire compatibility.

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque handle to an entity tracked by the change source
///
/// The change source owns the entity; the handle is only meaningful for the
/// duration of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef(pub u64);

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Lifecycle state of a tracked entity as reported by the change source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    Detached,
    Unchanged,
    Added,
    Modified,
    Deleted,
}

/// Kind of change an audit record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    /// Classify an entity state; anything outside Added/Modified/Deleted is invalid
    pub fn from_state(state: EntityState, entity_type: &str) -> Result<Self> {
        match state {
            EntityState::Added => Ok(AuditAction::Create),
            EntityState::Modified => Ok(AuditAction::Update),
            EntityState::Deleted => Ok(AuditAction::Delete),
            other => Err(AuditError::InvalidState {
                entity_type: entity_type.to_string(),
                state: other,
            }),
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::Create => write!(f, "create"),
            AuditAction::Update => write!(f, "update"),
            AuditAction::Delete => write!(f, "delete"),
        }
    }
}

/// Handle of a transaction opened on a persistence context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// How a transaction ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransactionStatus {
    Committed,
    RolledBack,
    Failed,
}

/// Context passed to consumer transaction hooks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEvent {
    /// Identifier of the unit of work the transaction belongs to
    pub context_id: String,

    /// The transaction, when still known to the persistence context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TransactionId>,
}

impl TransactionEvent {
    pub fn new(context_id: impl Into<String>, transaction: Option<TransactionId>) -> Self {
        Self {
            context_id: context_id.into(),
            transaction,
        }
    }
}
