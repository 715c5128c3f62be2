//! Entity rule registry and discovery
//!
//! Rules are registered once at startup against a `RuleKey` (entity type
//! tag, permission type, optional scope tag). `RuleScanner` is the
//! registration table: it collects candidate rules from one or more rule
//! modules, optionally filters them, and builds the registry. Resolution of
//! an unregistered combination is an error, never a default policy.

use crate::error::{AuditError, Result};
use crate::rule::EntityRule;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// Composite key a rule is registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleKey {
    pub entity_type: String,
    pub permission_type: &'static str,
    pub scope: Option<String>,
}

impl RuleKey {
    pub fn new(
        entity_type: impl Into<String>,
        permission_type: &'static str,
        scope: Option<&str>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            permission_type,
            scope: scope.map(str::to_string),
        }
    }

    /// Key for permission type `P`
    pub fn for_permission<P>(entity_type: impl Into<String>, scope: Option<&str>) -> Self {
        Self::new(entity_type, std::any::type_name::<P>(), scope)
    }
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "entity '{}' with permission '{}'",
            self.entity_type, self.permission_type
        )?;
        if let Some(scope) = &self.scope {
            write!(f, " in scope '{}'", scope)?;
        }
        Ok(())
    }
}

/// Maps rule keys to their registered entity rule
pub struct RuleRegistry<P> {
    rules: HashMap<RuleKey, Arc<dyn EntityRule<P>>>,
}

impl<P: 'static> RuleRegistry<P> {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            rules: HashMap::new(),
        }
    }

    /// Register a rule under the key it declares
    pub fn register(&mut self, rule: impl EntityRule<P> + 'static) -> Result<()> {
        self.register_arc(Arc::new(rule))
    }

    pub fn register_arc(&mut self, rule: Arc<dyn EntityRule<P>>) -> Result<()> {
        let key = RuleKey::for_permission::<P>(rule.entity_type(), rule.scope());
        if self.rules.contains_key(&key) {
            return Err(AuditError::DuplicateRule(key));
        }
        tracing::debug!(key = %key, "Entity rule registered");
        self.rules.insert(key, rule);
        Ok(())
    }

    /// Resolve the unscoped rule for an entity type
    pub fn resolve(&self, entity_type: &str) -> Result<Arc<dyn EntityRule<P>>> {
        self.resolve_key(&RuleKey::for_permission::<P>(entity_type, None))
    }

    /// Resolve the rule for an entity type within a scope
    pub fn resolve_scoped(&self, entity_type: &str, scope: &str) -> Result<Arc<dyn EntityRule<P>>> {
        self.resolve_key(&RuleKey::for_permission::<P>(entity_type, Some(scope)))
    }

    pub fn resolve_key(&self, key: &RuleKey) -> Result<Arc<dyn EntityRule<P>>> {
        self.rules
            .get(key)
            .cloned()
            .ok_or_else(|| AuditError::MissingRule { key: key.clone() })
    }

    /// Whether any scope has a rule for this entity type
    pub fn is_tracked(&self, entity_type: &str) -> bool {
        self.rules.keys().any(|k| k.entity_type == entity_type)
    }

    /// Entity types with a rule in any scope, sorted
    pub fn tracked_entity_types(&self) -> Vec<String> {
        self.rules
            .keys()
            .map(|k| k.entity_type.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RuleKey> {
        self.rules.keys()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Build one registry from several scanners
    pub fn from_scanners(scanners: impl IntoIterator<Item = RuleScanner<P>>) -> Result<Self> {
        let mut registry = Self::new();
        for scanner in scanners {
            scanner.register_into(&mut registry)?;
        }
        Ok(registry)
    }
}

impl<P: 'static> Default for RuleRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// One candidate found by a scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanResult {
    /// Key the rule would be registered under
    pub key: RuleKey,

    /// Logical entity name the rule records
    pub entity_name: String,
}

type ScanFilter = Box<dyn Fn(&ScanResult) -> bool + Send + Sync>;

/// Collects candidate entity rules for registration
pub struct RuleScanner<P> {
    candidates: Vec<Arc<dyn EntityRule<P>>>,
    filter: Option<ScanFilter>,
}

impl<P: 'static> RuleScanner<P> {
    pub fn new() -> Self {
        Self {
            candidates: Vec::new(),
            filter: None,
        }
    }

    /// Add a candidate rule
    pub fn with_rule(mut self, rule: impl EntityRule<P> + 'static) -> Self {
        self.candidates.push(Arc::new(rule));
        self
    }

    /// Add every rule a rule module provides
    pub fn with_rules(mut self, rules: impl IntoIterator<Item = Arc<dyn EntityRule<P>>>) -> Self {
        self.candidates.extend(rules);
        self
    }

    /// Skip candidates for which `keep` returns false
    pub fn filter(mut self, keep: impl Fn(&ScanResult) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Box::new(keep));
        self
    }

    fn describe(rule: &dyn EntityRule<P>) -> ScanResult {
        ScanResult {
            key: RuleKey::for_permission::<P>(rule.entity_type(), rule.scope()),
            entity_name: rule
                .display_name()
                .unwrap_or_else(|| rule.entity_type())
                .to_string(),
        }
    }

    fn keeps(&self, result: &ScanResult) -> bool {
        self.filter.as_ref().map_or(true, |keep| keep(result))
    }

    /// Describe the candidates that pass the filter
    pub fn scan(&self) -> Vec<ScanResult> {
        self.candidates
            .iter()
            .map(|rule| Self::describe(rule.as_ref()))
            .filter(|result| self.keeps(result))
            .collect()
    }

    /// Register the candidates that pass the filter
    pub fn register_into(self, registry: &mut RuleRegistry<P>) -> Result<()> {
        let mut skipped = 0usize;
        for rule in self.candidates.iter() {
            let result = Self::describe(rule.as_ref());
            if !self.keeps(&result) {
                skipped += 1;
                continue;
            }
            registry.register_arc(Arc::clone(rule))?;
        }
        tracing::debug!(
            registered = self.candidates.len() - skipped,
            skipped,
            "Rule scan complete"
        );
        Ok(())
    }

    pub fn into_registry(self) -> Result<RuleRegistry<P>> {
        let mut registry = RuleRegistry::new();
        self.register_into(&mut registry)?;
        Ok(registry)
    }
}

impl<P: 'static> Default for RuleScanner<P> {
    fn default() -> Self {
        Self::new()
    }
}
