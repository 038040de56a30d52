//! Migration Coordinator
//!
//! TigerStyle: Ask the new driver how its entity identifiers changed.
//!
//! Runs a second setup pass after a restore:
//! 1. begin (reconfigure), read, pick the restored device from `choice`
//! 2. advance `{choice, action: "migrate"}`, require `WAIT_USER_ACTION`
//! 3. advance `{previous_version}`, read the execution screen
//! 4. advance the execution inputs, pause, read the result
//! 5. parse `migration_data` (JSON in a textarea) into mappings
//!
//! An empty or unreadable result means "nothing to rewrite", not failure.
//! A driver that offers no device to migrate returns an outcome with
//! `executed == false`: nothing was asked of it, so nothing was rewritten.

use crate::config::PacingConfig;
use crate::remote::{DeviceApi, SetupInputs};
use crate::setup::fields::{
    self, MigrationSignals, ACTION_MIGRATE, FIELD_ACTION, FIELD_API_KEY, FIELD_AUTOMATED,
    FIELD_CHOICE, FIELD_CURRENT_VERSION, FIELD_MIGRATION_DATA, FIELD_PIN, FIELD_PREVIOUS_VERSION,
    FIELD_REMOTE_URL, VALUE_TRUE,
};
use crate::setup::setup_inputs;
use crate::setup::{FlowError, SetupSession, SetupSessionState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

// =============================================================================
// Types
// =============================================================================

/// One renamed entity identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationMapping {
    pub previous_entity_id: String,
    pub new_entity_id: String,
}

impl MigrationMapping {
    pub fn new(previous: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            previous_entity_id: previous.into(),
            new_entity_id: new.into(),
        }
    }
}

/// Inputs for one migration pass.
#[derive(Clone)]
pub struct MigrationRequest {
    pub driver_id: String,
    /// Version installed before the update
    pub previous_version: String,
    /// Version installed now
    pub current_version: String,
    /// URL of the remote, as the driver should reach it
    pub remote_url: String,
    /// API key handed to the driver; omitted from the request when empty
    pub api_key: Option<String>,
}

impl std::fmt::Debug for MigrationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRequest")
            .field("driver_id", &self.driver_id)
            .field("previous_version", &self.previous_version)
            .field("current_version", &self.current_version)
            .field("remote_url", &self.remote_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "****"))
            .finish()
    }
}

impl MigrationRequest {
    fn execution_inputs(&self) -> SetupInputs {
        let mut inputs = setup_inputs(&[
            (FIELD_PREVIOUS_VERSION, &self.previous_version),
            (FIELD_CURRENT_VERSION, &self.current_version),
            (FIELD_REMOTE_URL, &self.remote_url),
            (FIELD_PIN, ""),
            (FIELD_AUTOMATED, VALUE_TRUE),
        ]);
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            inputs.insert(FIELD_API_KEY.to_string(), key.to_string());
        }
        inputs
    }
}

/// Result of a migration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationOutcome {
    /// Mappings in the order the driver returned them
    pub mappings: Vec<MigrationMapping>,
    /// Sentinels seen during the pass
    pub signals: MigrationSignals,
    /// Error the driver declared, if the pass ended in `SETUP_ERROR`
    pub driver_error: Option<String>,
    /// Whether the execution step was submitted
    pub executed: bool,
}

/// Parse `migration_data`: `{"entity_mappings": [{previous_entity_id, new_entity_id}]}`.
///
/// Entries missing either id are skipped.
pub fn parse_migration_data(text: &str) -> Result<Vec<MigrationMapping>, FlowError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| FlowError::Data(format!("migration_data is not JSON: {}", e)))?;

    let Some(entries) = value.get("entity_mappings").and_then(Value::as_array) else {
        return Ok(Vec::new());
    };

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let previous = entry.get("previous_entity_id")?.as_str()?;
            let new = entry.get("new_entity_id")?.as_str()?;
            (!previous.is_empty() && !new.is_empty()).then(|| MigrationMapping::new(previous, new))
        })
        .collect())
}

/// Rewrite entity ids through `mappings`.
///
/// Output order follows `entities`; ids without a mapping pass through.
/// When an id is mapped twice the first mapping wins.
pub fn apply_mappings(entities: &[String], mappings: &[MigrationMapping]) -> Vec<String> {
    let mut lookup: HashMap<&str, &str> = HashMap::with_capacity(mappings.len());
    for mapping in mappings {
        lookup
            .entry(mapping.previous_entity_id.as_str())
            .or_insert(mapping.new_entity_id.as_str());
    }

    entities
        .iter()
        .map(|id| lookup.get(id.as_str()).map_or_else(|| id.clone(), |new| new.to_string()))
        .collect()
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives the migrate sub-flow of a driver's setup wizard.
pub struct MigrationCoordinator {
    api: Arc<dyn DeviceApi>,
    pacing: PacingConfig,
}

impl MigrationCoordinator {
    pub fn new(api: Arc<dyn DeviceApi>, pacing: PacingConfig) -> Self {
        Self { api, pacing }
    }

    /// Run the migration pass for `request.driver_id`.
    pub async fn migrate(&self, request: &MigrationRequest) -> Result<MigrationOutcome, FlowError> {
        tracing::info!(
            driver_id = %request.driver_id,
            previous = %request.previous_version,
            current = %request.current_version,
            "starting entity migration"
        );

        let session = SetupSession::new(self.api.clone(), request.driver_id.as_str(), &self.pacing);
        let result = self.run(&session, request).await;
        session.end().await;

        match &result {
            Ok(outcome) => tracing::info!(
                driver_id = %request.driver_id,
                mappings = outcome.mappings.len(),
                possible = outcome.signals.possible,
                required = outcome.signals.required,
                "migration pass finished"
            ),
            Err(e) => tracing::error!(driver_id = %request.driver_id, error = %e, "migration failed"),
        }
        result
    }

    async fn run(&self, session: &SetupSession, request: &MigrationRequest) -> Result<MigrationOutcome, FlowError> {
        let mut outcome = MigrationOutcome::default();

        let begin = session.begin(true).await?;
        outcome.signals = MigrationSignals::detect(&begin);
        self.pacing.pause(self.pacing.step_delay).await;

        let page = session.read_settled().await?;
        outcome.signals = outcome.signals.merge(MigrationSignals::detect(&page));
        let Some(choice) = fields::first_choice(&page) else {
            tracing::warn!(driver_id = %request.driver_id, "no device to migrate");
            return Ok(outcome);
        };

        session
            .advance(&setup_inputs(&[(FIELD_CHOICE, &choice), (FIELD_ACTION, ACTION_MIGRATE)]))
            .await?;
        self.pacing.pause(self.pacing.step_delay).await;

        let page = session.wait_for_state(SetupSessionState::WaitUserAction).await?;
        outcome.signals = outcome.signals.merge(MigrationSignals::detect(&page));

        session
            .advance(&setup_inputs(&[(FIELD_PREVIOUS_VERSION, &request.previous_version)]))
            .await?;
        self.pacing.pause(self.pacing.step_delay).await;

        let page = session.read_settled().await?;
        outcome.signals = outcome.signals.merge(MigrationSignals::detect(&page));

        session.advance(&request.execution_inputs()).await?;
        outcome.executed = true;
        self.pacing.pause(self.pacing.migration_execute_delay).await;

        let result = session.read_settled().await?;
        outcome.signals = outcome.signals.merge(MigrationSignals::detect(&result));
        if result.state == SetupSessionState::SetupError {
            // partial mappings may still be present
            tracing::error!(driver_id = %request.driver_id, error = ?result.error, "driver reported migration error");
            outcome.driver_error = Some(result.error.clone().unwrap_or_else(|| "SETUP_ERROR".to_string()));
        }

        match fields::textarea_value(&result, FIELD_MIGRATION_DATA) {
            Some(text) if !text.trim().is_empty() => match parse_migration_data(&text) {
                Ok(mappings) => outcome.mappings = mappings,
                Err(e) => tracing::warn!(driver_id = %request.driver_id, error = %e, "ignoring unreadable migration data"),
            },
            _ => tracing::warn!(driver_id = %request.driver_id, "no migration data returned"),
        }

        Ok(outcome)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{dropdown_field, label_field, page, textarea_field, SetupRequest, SimDevice};
    use serde_json::json;

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn request(api_key: Option<&str>) -> MigrationRequest {
        MigrationRequest {
            driver_id: "psn".to_string(),
            previous_version: "1.5.0".to_string(),
            current_version: "2.1.0".to_string(),
            remote_url: "http://192.168.1.20".to_string(),
            api_key: api_key.map(str::to_string),
        }
    }

    /// Driver that walks through the migrate screens and returns `data`.
    fn migrating_driver(device: &SimDevice, final_state: &'static str, data: &'static str) {
        device.set_responder("psn", move |req: &SetupRequest| match req {
            SetupRequest::Begin { .. } => page(
                "WAIT_USER_ACTION",
                json!([
                    dropdown_field("choice", "ps5"),
                    label_field("migration_possible", "Migration available")
                ]),
            ),
            SetupRequest::Advance { inputs } if inputs.contains_key("action") => page(
                "WAIT_USER_ACTION",
                json!([label_field("migration_required", "Entity ids changed in 2.0")]),
            ),
            SetupRequest::Advance { inputs } if inputs.contains_key("automated") => {
                page(final_state, json!([textarea_field("migration_data", data)]))
            }
            SetupRequest::Advance { .. } => page("WAIT_USER_ACTION", json!([])),
        });
    }

    #[test]
    fn test_apply_mappings_preserves_order() {
        let mappings = vec![MigrationMapping::new("A", "B")];
        assert_eq!(apply_mappings(&ids(&["A", "C"]), &mappings), ids(&["B", "C"]));
    }

    #[test]
    fn test_apply_mappings_first_wins_and_no_chaining() {
        let mappings = vec![
            MigrationMapping::new("a", "b"),
            MigrationMapping::new("a", "z"),
            MigrationMapping::new("b", "c"),
        ];
        assert_eq!(apply_mappings(&ids(&["b", "a", "x"]), &mappings), ids(&["c", "b", "x"]));
        assert!(apply_mappings(&[], &mappings).is_empty());
        assert_eq!(apply_mappings(&ids(&["a"]), &[]), ids(&["a"]));
    }

    #[test]
    fn test_parse_migration_data() {
        let text = r#"{"entity_mappings": [
            {"previous_entity_id": "psn.media_player.ps5", "new_entity_id": "psn.media_player.ps5_living"},
            {"previous_entity_id": "incomplete"},
            {"previous_entity_id": "", "new_entity_id": "x"}
        ]}"#;
        let mappings = parse_migration_data(text).unwrap();
        assert_eq!(
            mappings,
            vec![MigrationMapping::new("psn.media_player.ps5", "psn.media_player.ps5_living")]
        );

        assert!(parse_migration_data(r#"{"other": []}"#).unwrap().is_empty());
        assert!(matches!(parse_migration_data("nope"), Err(FlowError::Data(_))));
    }

    #[test]
    fn test_execution_inputs_omit_empty_api_key() {
        let inputs = request(Some("")).execution_inputs();
        assert!(!inputs.contains_key("api_key"));
        assert_eq!(inputs["pin"], "");
        assert_eq!(inputs["automated"], "true");

        let inputs = request(Some("k-123")).execution_inputs();
        assert_eq!(inputs["api_key"], "k-123");
        assert!(!format!("{:?}", request(Some("k-123"))).contains("k-123"));
    }

    #[tokio::test]
    async fn test_migrate_collects_mappings_and_signals() {
        let device = std::sync::Arc::new(SimDevice::new());
        device.add_driver("psn", "2.1.0");
        migrating_driver(
            &device,
            "SETUP_COMPLETE",
            r#"{"entity_mappings":[{"previous_entity_id":"old","new_entity_id":"new"}]}"#,
        );

        let coordinator = MigrationCoordinator::new(device.clone(), PacingConfig::immediate());
        let outcome = coordinator.migrate(&request(Some("k-123"))).await.unwrap();

        assert_eq!(outcome.mappings, vec![MigrationMapping::new("old", "new")]);
        assert!(outcome.signals.possible);
        assert!(outcome.signals.required);
        assert_eq!(outcome.driver_error, None);
        assert!(outcome.executed);

        let sent = device.inputs_sent("psn");
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], setup_inputs(&[("choice", "ps5"), ("action", "migrate")]));
        assert_eq!(sent[1], setup_inputs(&[("previous_version", "1.5.0")]));
        assert_eq!(sent[2]["current_version"], "2.1.0");
        assert_eq!(sent[2]["remote_url"], "http://192.168.1.20");
        assert_eq!(sent[2]["api_key"], "k-123");
        assert_eq!(device.setup_ends("psn"), 1);
    }

    #[tokio::test]
    async fn test_setup_error_still_extracts() {
        let device = std::sync::Arc::new(SimDevice::new());
        device.add_driver("psn", "2.1.0");
        migrating_driver(
            &device,
            "SETUP_ERROR",
            r#"{"entity_mappings":[{"previous_entity_id":"a","new_entity_id":"b"}]}"#,
        );

        let coordinator = MigrationCoordinator::new(device.clone(), PacingConfig::immediate());
        let outcome = coordinator.migrate(&request(None)).await.unwrap();
        assert_eq!(outcome.mappings.len(), 1);
        assert!(outcome.driver_error.is_some());
    }

    #[tokio::test]
    async fn test_unexpected_state_aborts_and_ends() {
        let device = std::sync::Arc::new(SimDevice::new());
        device.add_driver("psn", "2.1.0");
        device.set_responder("psn", |req: &SetupRequest| match req {
            SetupRequest::Begin { .. } => page("WAIT_USER_ACTION", json!([dropdown_field("choice", "ps5")])),
            SetupRequest::Advance { .. } => page("SETUP_COMPLETE", json!([])),
        });

        let coordinator = MigrationCoordinator::new(device.clone(), PacingConfig::immediate());
        let result = coordinator.migrate(&request(None)).await;
        assert!(matches!(
            result,
            Err(FlowError::UnexpectedState { expected: SetupSessionState::WaitUserAction, .. })
        ));
        assert_eq!(device.inputs_sent("psn").len(), 1);
        assert_eq!(device.setup_ends("psn"), 1);
    }

    #[tokio::test]
    async fn test_no_device_offered_is_not_executed() {
        let device = std::sync::Arc::new(SimDevice::new());
        device.add_driver("psn", "2.1.0");
        device.set_responder("psn", |_req: &SetupRequest| {
            page("WAIT_USER_ACTION", json!([label_field("migration_possible", "Migration available")]))
        });

        let coordinator = MigrationCoordinator::new(device.clone(), PacingConfig::immediate());
        let outcome = coordinator.migrate(&request(None)).await.unwrap();
        assert!(!outcome.executed);
        assert!(outcome.mappings.is_empty());
        assert!(device.inputs_sent("psn").is_empty());
        assert_eq!(device.setup_ends("psn"), 1);
    }

    #[tokio::test]
    async fn test_unreadable_data_means_no_mappings() {
        let device = std::sync::Arc::new(SimDevice::new());
        device.add_driver("psn", "2.1.0");
        migrating_driver(&device, "SETUP_COMPLETE", "{{not json");

        let coordinator = MigrationCoordinator::new(device.clone(), PacingConfig::immediate());
        let outcome = coordinator.migrate(&request(None)).await.unwrap();
        assert!(outcome.mappings.is_empty());
    }
}
