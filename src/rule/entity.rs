//! Entity rules — per-entity-type property chains plus a read permission

use super::builtin::{ChangeValueRule, DecryptRule, IgnoreRule, RenameRule};
use super::{PropertyRule, PropertyRuleChain, RuleContext};
use crate::crypto::AuditDecryption;
use crate::error::{AuditError, Result};
use crate::value::{FieldValue, FromFieldValue, NameValue, TrackedProperties};
use std::collections::HashMap;
use std::sync::Arc;

/// A domain type that can be audited, identified by a stable type tag
///
/// The tag must match the entity type the change source reports.
pub trait AuditedEntity {
    const ENTITY_TYPE: &'static str;
}

/// Registered transformation and permission policy for one entity type
///
/// Primary key properties are filtered out before `execute_rules` is
/// called, so implementations never special-case keys.
pub trait EntityRule<P>: Send + Sync {
    /// Entity type tag this rule applies to
    fn entity_type(&self) -> &str;

    /// Optional scope tag (persistence unit) this rule belongs to
    fn scope(&self) -> Option<&str> {
        None
    }

    /// Permission required to read records produced by this rule
    fn permission(&self) -> &P;

    /// Logical name recorded instead of the type tag, if any
    fn display_name(&self) -> Option<&str> {
        None
    }

    /// Run the chain for one property and write the result into `target`
    fn execute_rules(
        &self,
        property: &str,
        value: FieldValue,
        target: &mut TrackedProperties,
    ) -> Result<()>;
}

/// Declarative entity rule built from per-property chains
///
/// ```rust
/// use a3s_audit::{EntityRule, EntityRules, FieldValue, TrackedProperties};
///
/// let rule = EntityRules::builder("Invoice", "finance")
///     .property("InternalNotes", |p| p.ignore())
///     .property("Total", |p| p.rename("AmountDue"))
///     .build();
///
/// let mut props = TrackedProperties::new();
/// rule.execute_rules("Total", FieldValue::Float(150.0), &mut props).unwrap();
/// rule.execute_rules("InternalNotes", FieldValue::from("vip"), &mut props).unwrap();
/// assert_eq!(props.len(), 1);
/// assert_eq!(props["AmountDue"], FieldValue::Float(150.0));
/// ```
pub struct EntityRules<P> {
    entity_type: String,
    scope: Option<String>,
    display_name: Option<String>,
    permission: P,
    chains: HashMap<String, PropertyRuleChain>,
}

impl<P> EntityRules<P> {
    /// Start building rules for an entity type tag
    pub fn builder(entity_type: impl Into<String>, permission: P) -> EntityRulesBuilder<P> {
        EntityRulesBuilder {
            entity_type: entity_type.into(),
            scope: None,
            display_name: None,
            permission,
            chains: HashMap::new(),
        }
    }

    /// Start building rules for a typed entity
    pub fn for_entity<E: AuditedEntity>(permission: P) -> EntityRulesBuilder<P> {
        Self::builder(E::ENTITY_TYPE, permission)
    }

    /// Chain registered for a property, if any
    pub fn chain(&self, property: &str) -> Option<&PropertyRuleChain> {
        self.chains.get(property)
    }
}

impl<P: Send + Sync> EntityRule<P> for EntityRules<P> {
    fn entity_type(&self) -> &str {
        &self.entity_type
    }

    fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    fn permission(&self) -> &P {
        &self.permission
    }

    fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref()
    }

    fn execute_rules(
        &self,
        property: &str,
        value: FieldValue,
        target: &mut TrackedProperties,
    ) -> Result<()> {
        let result = match self.chains.get(property) {
            None => Some(NameValue::new(property, value)),
            Some(chain) => {
                let ctx = RuleContext {
                    entity_type: &self.entity_type,
                    property,
                };
                chain.apply(&ctx, NameValue::new(property, value))?
            }
        };

        if let Some(NameValue { name, value }) = result {
            if target.contains_key(&name) {
                return Err(AuditError::DuplicateProperty {
                    entity_type: self.entity_type.clone(),
                    property: name,
                });
            }
            target.insert(name, value);
        }

        Ok(())
    }
}

impl<P: std::fmt::Debug> std::fmt::Debug for EntityRules<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityRules")
            .field("entity_type", &self.entity_type)
            .field("scope", &self.scope)
            .field("permission", &self.permission)
            .field("chains", &self.chains.len())
            .finish()
    }
}

/// Builder for `EntityRules`
pub struct EntityRulesBuilder<P> {
    entity_type: String,
    scope: Option<String>,
    display_name: Option<String>,
    permission: P,
    chains: HashMap<String, PropertyRuleChain>,
}

impl<P> EntityRulesBuilder<P> {
    /// Restrict the rule to one persistence unit
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Record a logical name instead of the type tag
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Configure the chain for a property
    ///
    /// Calling this again for the same property appends to its chain.
    pub fn property(
        mut self,
        name: impl Into<String>,
        configure: impl FnOnce(PropertyRuleBuilder) -> PropertyRuleBuilder,
    ) -> Self {
        let name = name.into();
        let chain = self
            .chains
            .remove(&name)
            .unwrap_or_else(|| PropertyRuleChain::new(name.clone()));
        let chain = configure(PropertyRuleBuilder { chain }).chain;
        self.chains.insert(name, chain);
        self
    }

    pub fn build(self) -> EntityRules<P> {
        EntityRules {
            entity_type: self.entity_type,
            scope: self.scope,
            display_name: self.display_name,
            permission: self.permission,
            chains: self.chains,
        }
    }
}

/// Fluent builder for one property chain
pub struct PropertyRuleBuilder {
    chain: PropertyRuleChain,
}

impl PropertyRuleBuilder {
    pub fn ignore(self) -> Self {
        self.rule(IgnoreRule)
    }

    pub fn rename(self, name: impl Into<String>) -> Self {
        self.rule(RenameRule::new(name))
    }

    /// `includes_hash` must match the value used when the column was encrypted
    pub fn decrypt(self, decryption: Arc<dyn AuditDecryption>, includes_hash: bool) -> Self {
        self.rule(DecryptRule::new(decryption, includes_hash))
    }

    pub fn change_value<T, F>(self, change: F) -> Self
    where
        T: FromFieldValue + 'static,
        F: Fn(Option<T>) -> FieldValue + Send + Sync + 'static,
    {
        self.rule(ChangeValueRule::new(change))
    }

    /// Append a custom rule
    pub fn rule(mut self, rule: impl PropertyRule + 'static) -> Self {
        self.chain.push(rule);
        self
    }
}
