//! Property rule pipeline
//!
//! A `PropertyRule` transforms one property's (name, value) pair. Rules for
//! the same property form a `PropertyRuleChain`: each rule consumes the
//! previous rule's output, and a discard anywhere stops the chain and drops
//! the property from the record.

use crate::error::Result;
use crate::value::NameValue;

pub mod builtin;
pub mod entity;

pub use builtin::{ChangeValueRule, DecryptRule, IgnoreRule, RenameRule};
pub use entity::{AuditedEntity, EntityRule, EntityRules, EntityRulesBuilder, PropertyRuleBuilder};

/// Where a rule is running, for error reporting
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    /// Entity type tag of the entity being captured
    pub entity_type: &'a str,

    /// Property name before any rename in the chain
    pub property: &'a str,
}

/// Core trait for a single property transformation
///
/// `Ok(None)` discards the property. `Err` is reserved for configuration
/// errors that must stop the unit of work.
pub trait PropertyRule: Send + Sync {
    fn apply(&self, ctx: &RuleContext<'_>, input: NameValue) -> Result<Option<NameValue>>;
}

/// Ordered rules registered for one property
pub struct PropertyRuleChain {
    property: String,
    rules: Vec<Box<dyn PropertyRule>>,
}

impl PropertyRuleChain {
    pub fn new(property: impl Into<String>) -> Self {
        Self {
            property: property.into(),
            rules: Vec::new(),
        }
    }

    /// Property this chain is registered for
    pub fn property(&self) -> &str {
        &self.property
    }

    /// Append a rule to the end of the chain
    pub fn push(&mut self, rule: impl PropertyRule + 'static) {
        self.rules.push(Box::new(rule));
    }

    pub fn push_boxed(&mut self, rule: Box<dyn PropertyRule>) {
        self.rules.push(rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl PropertyRule for PropertyRuleChain {
    fn apply(&self, ctx: &RuleContext<'_>, input: NameValue) -> Result<Option<NameValue>> {
        let mut current = input;
        for rule in &self.rules {
            match rule.apply(ctx, current)? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}

impl std::fmt::Debug for PropertyRuleChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropertyRuleChain")
            .field("property", &self.property)
            .field("rules", &self.rules.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn ctx() -> RuleContext<'static> {
        RuleContext {
            entity_type: "Invoice",
            property: "Total",
        }
    }

    struct CountingRule(Arc<AtomicUsize>);

    impl PropertyRule for CountingRule {
        fn apply(&self, _ctx: &RuleContext<'_>, input: NameValue) -> Result<Option<NameValue>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(input))
        }
    }

    #[test]
    fn test_empty_chain_passes_through() {
        let chain = PropertyRuleChain::new("Total");
        let out = chain.apply(&ctx(), NameValue::new("Total", 1.5)).unwrap();
        assert_eq!(out, Some(NameValue::new("Total", 1.5)));
    }

    #[test]
    fn test_chain_feeds_previous_output() {
        let mut chain = PropertyRuleChain::new("Total");
        chain.push(RenameRule::new("Amount"));
        chain.push(RenameRule::new("AmountDue"));
        chain.push(ChangeValueRule::new(|v: Option<f64>| {
            FieldValue::from(v.map(|v| v * 2.0))
        }));

        let out = chain.apply(&ctx(), NameValue::new("Total", 75.0)).unwrap();
        assert_eq!(out, Some(NameValue::new("AmountDue", 150.0)));
    }

    #[test]
    fn test_discard_short_circuits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = PropertyRuleChain::new("Total");
        chain.push(CountingRule(calls.clone()));
        chain.push(IgnoreRule);
        chain.push(CountingRule(calls.clone()));

        let out = chain.apply(&ctx(), NameValue::new("Total", 1)).unwrap();
        assert!(out.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ignore_at_any_position_discards() {
        for position in 0..3 {
            let mut chain = PropertyRuleChain::new("Total");
            for i in 0..3 {
                if i == position {
                    chain.push(IgnoreRule);
                } else {
                    chain.push(RenameRule::new(format!("n{}", i)));
                }
            }
            assert!(chain
                .apply(&ctx(), NameValue::new("Total", 1))
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_chains_nest() {
        let mut inner = PropertyRuleChain::new("Total");
        inner.push(RenameRule::new("Inner"));
        let mut outer = PropertyRuleChain::new("Total");
        outer.push(inner);
        outer.push(RenameRule::new("Outer"));

        assert_eq!(outer.len(), 2);
        let out = outer.apply(&ctx(), NameValue::new("Total", 1)).unwrap();
        assert_eq!(out.map(|nv| nv.name).as_deref(), Some("Outer"));
    }
}
