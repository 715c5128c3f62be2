//! Error types for a3s-audit

use crate::registry::RuleKey;
use crate::types::EntityState;
use thiserror::Error;

/// Errors that can occur while capturing or delivering audit records
#[derive(Debug, Error)]
pub enum AuditError {
    /// No entity rule registered for an entity found in a change snapshot
    #[error("No entity rule registered for {key}")]
    MissingRule { key: RuleKey },

    /// A rule received a value of the wrong runtime type
    #[error(
        "Type mismatch on entity '{entity_type}' property '{property}': expected {expected}, got {actual}"
    )]
    TypeMismatch {
        entity_type: String,
        property: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// The change source reported a lifecycle state that cannot be audited
    #[error("Invalid entity state {state:?} for entity '{entity_type}'")]
    InvalidState {
        entity_type: String,
        state: EntityState,
    },

    /// Two properties of one entity resolved to the same recorded name
    #[error("Property '{property}' recorded twice for entity '{entity_type}'")]
    DuplicateProperty {
        entity_type: String,
        property: String,
    },

    /// A rule was registered twice for the same key
    #[error("Duplicate entity rule for {0}")]
    DuplicateRule(RuleKey),

    /// Decryption collaborator failure
    #[error("Decryption error: {0}")]
    Decryption(String),

    /// Audit consumer delivery failure
    #[error("Consumer error: {0}")]
    Consumer(String),

    /// Transaction begin/commit/rollback failure
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The operation observed a cancelled token
    #[error("Operation cancelled")]
    Cancelled,
}

impl AuditError {
    /// Whether this error indicates a misconfiguration that must stop the unit of work
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AuditError::MissingRule { .. }
                | AuditError::TypeMismatch { .. }
                | AuditError::InvalidState { .. }
                | AuditError::DuplicateProperty { .. }
        )
    }
}

/// Result type alias for audit operations
pub type Result<T> = std::result::Result<T, AuditError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let missing = AuditError::MissingRule {
            key: RuleKey::new("Order", "app::Permission", None),
        };
        assert!(missing.is_fatal());

        let mismatch = AuditError::TypeMismatch {
            entity_type: "Customer".to_string(),
            property: "Ssn".to_string(),
            expected: "bytes",
            actual: "text",
        };
        assert!(mismatch.is_fatal());

        assert!(!AuditError::Consumer("sink down".to_string()).is_fatal());
        assert!(!AuditError::Transaction("commit failed".to_string()).is_fatal());
        assert!(!AuditError::Cancelled.is_fatal());
    }

    #[test]
    fn test_type_mismatch_message_names_entity_and_property() {
        let err = AuditError::TypeMismatch {
            entity_type: "Customer".to_string(),
            property: "Ssn".to_string(),
            expected: "bytes",
            actual: "text",
        };
        let msg = err.to_string();
        assert!(msg.contains("Customer"));
        assert!(msg.contains("Ssn"));
        assert!(msg.contains("text"));
    }

    #[test]
    fn test_missing_rule_message_names_key() {
        let err = AuditError::MissingRule {
            key: RuleKey::new("Order", "app::Permission", Some("billing")),
        };
        let msg = err.to_string();
        assert!(msg.contains("Order"));
        assert!(msg.contains("app::Permission"));
        assert!(msg.contains("billing"));
    }
}
