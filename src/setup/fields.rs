//! Form field extraction.
//!
//! Pure lookups over a [`SessionSnapshot`]. Absence is a normal outcome
//! (the driver may not offer the capability) and is reported as `None` /
//! `false`, never as an error.

use super::{Field, FieldValue, SessionSnapshot};

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Device selection dropdown offered by reconfigure flows
pub const FIELD_CHOICE: &str = "choice";
/// Requested action in a reconfigure flow
pub const FIELD_ACTION: &str = "action";
/// Backup payload (request placeholder and response textarea)
pub const FIELD_BACKUP_DATA: &str = "backup_data";
/// Switches a fresh setup into restore mode
pub const FIELD_RESTORE_FROM_BACKUP: &str = "restore_from_backup";
/// Backup payload submitted for restore
pub const FIELD_RESTORE_DATA: &str = "restore_data";
/// Sentinel: the driver supports entity migration
pub const FIELD_MIGRATION_POSSIBLE: &str = "migration_possible";
/// Sentinel: migration is needed for this upgrade (non-empty label)
pub const FIELD_MIGRATION_REQUIRED: &str = "migration_required";
/// Migration result textarea (JSON text)
pub const FIELD_MIGRATION_DATA: &str = "migration_data";
pub const FIELD_PREVIOUS_VERSION: &str = "previous_version";
pub const FIELD_CURRENT_VERSION: &str = "current_version";
pub const FIELD_REMOTE_URL: &str = "remote_url";
pub const FIELD_PIN: &str = "pin";
pub const FIELD_AUTOMATED: &str = "automated";
pub const FIELD_API_KEY: &str = "api_key";

/// Action value requesting a configuration backup
pub const ACTION_BACKUP: &str = "backup";
/// Action value requesting an entity migration
pub const ACTION_MIGRATE: &str = "migrate";

/// Boolean inputs are sent as strings
pub const VALUE_TRUE: &str = "true";

/// Placeholder sent in the backup request
pub const BACKUP_DATA_PLACEHOLDER: &str = "[]";

// =============================================================================
// Lookups
// =============================================================================

/// Find a field by id.
pub fn find<'a>(snapshot: &'a SessionSnapshot, field_id: &str) -> Option<&'a Field> {
    snapshot.fields.iter().find(|f| f.id == field_id)
}

/// Whether a field with the given id is present.
pub fn has_field(snapshot: &SessionSnapshot, field_id: &str) -> bool {
    find(snapshot, field_id).is_some()
}

/// Selected value of the `choice` dropdown, if present and non-empty.
pub fn first_choice(snapshot: &SessionSnapshot) -> Option<String> {
    match &find(snapshot, FIELD_CHOICE)?.value {
        FieldValue::Dropdown(Some(value)) if !value.is_empty() => Some(value.clone()),
        _ => None,
    }
}

/// Text content of a textarea field.
pub fn textarea_value(snapshot: &SessionSnapshot, field_id: &str) -> Option<String> {
    match &find(snapshot, field_id)?.value {
        FieldValue::Textarea(value) => value.clone(),
        _ => None,
    }
}

/// Text of a label field.
pub fn label_value(snapshot: &SessionSnapshot, field_id: &str) -> Option<String> {
    match &find(snapshot, field_id)?.value {
        FieldValue::Label(value) => value.clone(),
        _ => None,
    }
}

/// Migration signals advertised by a setup page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationSignals {
    /// Driver supports migration at all
    pub possible: bool,
    /// Driver says this upgrade needs it
    pub required: bool,
}

impl MigrationSignals {
    /// Read both sentinels from a snapshot.
    pub fn detect(snapshot: &SessionSnapshot) -> Self {
        Self {
            possible: has_field(snapshot, FIELD_MIGRATION_POSSIBLE),
            required: label_value(snapshot, FIELD_MIGRATION_REQUIRED)
                .map(|text| !text.trim().is_empty())
                .unwrap_or(false),
        }
    }

    /// Combine signals seen across several reads.
    pub fn merge(self, other: Self) -> Self {
        Self {
            possible: self.possible || other.possible,
            required: self.required || other.required,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::setup::SetupSessionState;
    use serde_json::json;

    fn snapshot(settings: serde_json::Value) -> SessionSnapshot {
        SessionSnapshot::from_response(&json!({
            "state": "WAIT_USER_ACTION",
            "require_user_action": {"input": {"settings": settings}}
        }))
    }

    #[test]
    fn test_first_choice() {
        let s = snapshot(json!([
            {"id": "choice", "field": {"dropdown": {"value": "living_room"}}}
        ]));
        assert_eq!(first_choice(&s), Some("living_room".to_string()));

        let empty = snapshot(json!([
            {"id": "choice", "field": {"dropdown": {"value": ""}}}
        ]));
        assert_eq!(first_choice(&empty), None);

        let none = snapshot(json!([]));
        assert_eq!(first_choice(&none), None);
    }

    #[test]
    fn test_first_choice_wrong_widget() {
        let s = snapshot(json!([
            {"id": "choice", "field": {"textarea": {"value": "x"}}}
        ]));
        assert_eq!(first_choice(&s), None);
    }

    #[test]
    fn test_textarea_value() {
        let s = snapshot(json!([
            {"id": "backup_data", "field": {"textarea": {"value": "{\"a\":1}"}}}
        ]));
        assert_eq!(textarea_value(&s, FIELD_BACKUP_DATA), Some("{\"a\":1}".to_string()));
        assert_eq!(textarea_value(&s, FIELD_MIGRATION_DATA), None);
    }

    #[test]
    fn test_has_field_on_empty_snapshot() {
        let s = SessionSnapshot {
            state: SetupSessionState::SetupComplete,
            fields: Vec::new(),
            error: None,
        };
        assert!(!has_field(&s, FIELD_MIGRATION_POSSIBLE));
    }

    #[test]
    fn test_migration_signals() {
        let s = snapshot(json!([
            {"id": "migration_possible", "field": {"label": {"value": ""}}},
            {"id": "migration_required", "field": {"label": {"value": {"en": "Entity ids changed"}}}}
        ]));
        let signals = MigrationSignals::detect(&s);
        assert!(signals.possible);
        assert!(signals.required);

        let blank = snapshot(json!([
            {"id": "migration_required", "field": {"label": {"value": "  "}}}
        ]));
        let signals = MigrationSignals::detect(&blank);
        assert!(!signals.possible);
        assert!(!signals.required);

        let merged = MigrationSignals { possible: true, required: false }
            .merge(MigrationSignals { possible: false, required: true });
        assert_eq!(merged, MigrationSignals { possible: true, required: true });
    }
}
