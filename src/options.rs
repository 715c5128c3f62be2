//! Audit trail configuration

use crate::error::{AuditError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// User-configurable settings for the audit coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditTrailOptions {
    /// Open a transaction for the unit of work when none is open, so that
    /// records from several flushes are delivered with its outcome
    pub auto_open_transaction: bool,
}

impl AuditTrailOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_auto_open_transaction(mut self, enabled: bool) -> Self {
        self.auto_open_transaction = enabled;
        self
    }

    /// Parse options from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| AuditError::Config(format!("Failed to parse audit options: {}", e)))
    }

    /// Load options from a TOML file, returning defaults if it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!(
                "Failed to read audit options {}: {}",
                path.display(),
                e
            ))
        })?;

        let options = Self::from_toml_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            auto_open_transaction = options.auto_open_transaction,
            "Audit options loaded"
        );
        Ok(options)
    }
}
