//! Built-in property rules

use super::{PropertyRule, RuleContext};
use crate::crypto::AuditDecryption;
use crate::error::{AuditError, Result};
use crate::value::{FieldValue, FromFieldValue, NameValue};
use std::marker::PhantomData;
use std::sync::Arc;

/// Drops the property from the record
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreRule;

impl PropertyRule for IgnoreRule {
    fn apply(&self, _ctx: &RuleContext<'_>, _input: NameValue) -> Result<Option<NameValue>> {
        Ok(None)
    }
}

/// Records the property under a different name
#[derive(Debug, Clone)]
pub struct RenameRule {
    name: String,
}

impl RenameRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl PropertyRule for RenameRule {
    fn apply(&self, _ctx: &RuleContext<'_>, input: NameValue) -> Result<Option<NameValue>> {
        Ok(Some(NameValue {
            name: self.name.clone(),
            value: input.value,
        }))
    }
}

/// Replaces an encrypted byte value with its decrypted text
///
/// Any input other than bytes or null is a configuration error and fails
/// with `TypeMismatch`.
pub struct DecryptRule {
    decryption: Arc<dyn AuditDecryption>,
    includes_hash: bool,
}

impl DecryptRule {
    /// `includes_hash` must match the value used when the column was encrypted
    pub fn new(decryption: Arc<dyn AuditDecryption>, includes_hash: bool) -> Self {
        Self {
            decryption,
            includes_hash,
        }
    }
}

impl PropertyRule for DecryptRule {
    fn apply(&self, ctx: &RuleContext<'_>, input: NameValue) -> Result<Option<NameValue>> {
        let cipher_text = match &input.value {
            FieldValue::Bytes(bytes) => Some(bytes.as_ref()),
            FieldValue::Null => None,
            other => {
                return Err(AuditError::TypeMismatch {
                    entity_type: ctx.entity_type.to_string(),
                    property: ctx.property.to_string(),
                    expected: "bytes",
                    actual: other.type_name(),
                })
            }
        };

        let plaintext = self.decryption.decrypt(cipher_text, self.includes_hash)?;
        Ok(Some(NameValue {
            name: input.name,
            value: FieldValue::from(plaintext),
        }))
    }
}

impl std::fmt::Debug for DecryptRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptRule")
            .field("includes_hash", &self.includes_hash)
            .finish()
    }
}

/// Replaces the value with the output of a user function
///
/// The function receives `None` when the value is null or cannot be cast
/// to `T`.
pub struct ChangeValueRule<T, F> {
    change: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> ChangeValueRule<T, F>
where
    T: FromFieldValue,
    F: Fn(Option<T>) -> FieldValue + Send + Sync,
{
    pub fn new(change: F) -> Self {
        Self {
            change,
            _marker: PhantomData,
        }
    }
}

impl<T, F> PropertyRule for ChangeValueRule<T, F>
where
    T: FromFieldValue,
    F: Fn(Option<T>) -> FieldValue + Send + Sync,
{
    fn apply(&self, _ctx: &RuleContext<'_>, input: NameValue) -> Result<Option<NameValue>> {
        let typed = T::from_field_value(&input.value);
        Ok(Some(NameValue {
            name: input.name,
            value: (self.change)(typed),
        }))
    }
}
