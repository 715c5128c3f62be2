//! # a3s-audit
//!
//! Audit trail capture and delivery for units of work in the A3S ecosystem.
//!
//! ## Overview
//!
//! `a3s-audit` observes a persistence context through a save cycle and turns
//! its pending changes into audit records. Each audited entity type has a
//! registered rule that decides which properties are recorded, under which
//! names, in what form, and which permission is needed to read the result.
//! Records are delivered to a pluggable consumer once the write is durable.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use a3s_audit::{AuditConsumer, AuditCoordinator, EntityRules, MemoryConsumer, RuleRegistry};
//! use a3s_audit::context::memory::MemoryUnitOfWork;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let mut registry = RuleRegistry::new();
//! registry.register(
//!     EntityRules::builder("Invoice", "finance")
//!         .property("InternalNotes", |p| p.ignore())
//!         .property("Total", |p| p.rename("AmountDue"))
//!         .build(),
//! )?;
//!
//! let consumer = Arc::new(MemoryConsumer::<&'static str>::new());
//! let sink: Arc<dyn AuditConsumer<&'static str>> = consumer.clone();
//! let coordinator = AuditCoordinator::new(Arc::new(registry), sink);
//!
//! let uow = MemoryUnitOfWork::new("req-1");
//! uow.add("Invoice", [("Total", 150.0)]);
//!
//! let cancel = CancellationToken::new();
//! coordinator.start_collecting(&uow, &cancel).await?;
//! uow.flush();
//! coordinator.finish_and_maybe_dispatch(&uow, &cancel).await?;
//!
//! assert_eq!(consumer.records().await[0].data_json, r#"{"AmountDue":150.0}"#);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **PropertyRule** — one transformation of a (name, value) pair; chains short-circuit on discard
//! - **EntityRule** — per-entity-type property chains plus a read permission
//! - **RuleRegistry** — startup registration table keyed by entity, permission and scope
//! - **UnitOfWork** — what a persistence context must expose: change snapshot and transaction control
//! - **AuditCoordinator** — capture, reconciliation and at-most-once delivery for one unit of work
//! - **AuditConsumer** — where reconciled records go

pub mod consumer;
pub mod context;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod options;
pub mod record;
pub mod registry;
pub mod rule;
pub mod types;
pub mod value;

// Re-export core types
pub use consumer::{AuditConsumer, MemoryConsumer, TracingConsumer};
pub use context::{ChangeSource, PropertyEntry, TrackedEntry, TransactionControl, UnitOfWork};
pub use coordinator::{AuditCoordinator, AuditCoordinatorBuilder, LifecyclePhase, TransactionPhase};
pub use crypto::{Aes256GcmDecryption, AuditDecryption};
pub use error::{AuditError, Result};
pub use options::AuditTrailOptions;
pub use record::{AuditRecordAfterSave, AuditRecordBeforeSave};
pub use registry::{RuleKey, RuleRegistry, RuleScanner, ScanResult};
pub use rule::{
    AuditedEntity, EntityRule, EntityRules, EntityRulesBuilder, PropertyRule, PropertyRuleBuilder,
    PropertyRuleChain, RuleContext,
};
pub use types::{
    AuditAction, EntityRef, EntityState, TransactionEvent, TransactionId, TransactionStatus,
};
pub use value::{FieldValue, FromFieldValue, NameValue, TrackedProperties};

// Re-export the in-memory context for convenience
pub use context::memory::MemoryUnitOfWork;
