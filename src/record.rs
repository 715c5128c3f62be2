//! Audit records before and after the physical write

use crate::types::{AuditAction, EntityRef};
use crate::value::TrackedProperties;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Record captured before the physical write
///
/// Exactly one exists per (entity, unit of work). `entity_id` is always
/// `None` for creates until the record is reconciled after the write.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecordBeforeSave<P> {
    /// Correlation id, preserved into the after-save record
    pub unique_id: Uuid,

    /// Tracked entity this record describes
    #[serde(skip)]
    pub entity: EntityRef,

    pub action: AuditAction,

    /// Logical entity name (rule display name or entity type tag)
    pub entity_name: String,

    /// Opaque primary key string, best effort
    pub entity_id: Option<String>,

    /// Output of the rule pipeline
    pub modified_properties: TrackedProperties,

    /// JSON projection of `modified_properties`
    pub data_json: String,

    /// Permission required to read this record
    pub required_read_permission: P,

    pub timestamp: DateTime<Utc>,
}

/// Record reconciled after the physical write, ready for delivery
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecordAfterSave<P> {
    pub unique_id: Uuid,

    #[serde(skip)]
    pub entity: EntityRef,

    pub action: AuditAction,

    pub entity_name: String,

    pub entity_id: Option<String>,

    pub modified_properties: TrackedProperties,

    pub data_json: String,

    pub required_read_permission: P,

    pub timestamp: DateTime<Utc>,
}

impl<P> AuditRecordBeforeSave<P> {
    /// Promote to an after-save record
    ///
    /// Only creates take `resolved_id`; updates and deletes keep the id
    /// captured before the write.
    pub fn into_after_save(self, resolved_id: Option<String>) -> AuditRecordAfterSave<P> {
        let entity_id = match self.action {
            AuditAction::Create => resolved_id,
            AuditAction::Update | AuditAction::Delete => self.entity_id,
        };

        AuditRecordAfterSave {
            unique_id: self.unique_id,
            entity: self.entity,
            action: self.action,
            entity_name: self.entity_name,
            entity_id,
            modified_properties: self.modified_properties,
            data_json: self.data_json,
            required_read_permission: self.required_read_permission,
            timestamp: self.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FieldValue;

    fn before(action: AuditAction, entity_id: Option<&str>) -> AuditRecordBeforeSave<&'static str> {
        let mut props = TrackedProperties::new();
        props.insert("Total".to_string(), FieldValue::Float(10.0));
        AuditRecordBeforeSave {
            unique_id: Uuid::new_v4(),
            entity: EntityRef(1),
            action,
            entity_name: "Order".to_string(),
            entity_id: entity_id.map(str::to_string),
            data_json: serde_json::to_string(&props).unwrap(),
            modified_properties: props,
            required_read_permission: "finance",
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_create_takes_resolved_id() {
        let record = before(AuditAction::Create, None);
        let uid = record.unique_id;
        let after = record.into_after_save(Some("17".to_string()));
        assert_eq!(after.entity_id.as_deref(), Some("17"));
        assert_eq!(after.unique_id, uid);
    }

    #[test]
    fn test_delete_keeps_captured_id() {
        let record = before(AuditAction::Delete, Some("5"));
        let after = record.into_after_save(None);
        assert_eq!(after.entity_id.as_deref(), Some("5"));
    }

    #[test]
    fn test_after_save_serialization() {
        let after = before(AuditAction::Update, Some("5")).into_after_save(None);
        let json = serde_json::to_value(&after).unwrap();
        assert_eq!(json["action"], "Update");
        assert_eq!(json["entityId"], "5");
        assert_eq!(json["entityName"], "Order");
        assert_eq!(json["requiredReadPermission"], "finance");
        assert_eq!(json["modifiedProperties"]["Total"], 10.0);
        assert!(json.get("entity").is_none());
    }
}
