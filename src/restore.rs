//! Restore Coordinator
//!
//! TigerStyle: Replay a captured configuration into a freshly installed driver.
//!
//! Protocol:
//! 1. begin (no reconfigure)
//! 2. advance `{restore_from_backup: "true"}`, pause
//! 3. advance `{restore_from_backup: "true", restore_data}`, pause longer
//! 4. verify: find the driver's enabled instance, read its device state
//! 5. end the session, then list the restored instance's unregistered entities
//!
//! Verification is informational; only the protocol steps can fail a restore.

use crate::backup::BackupRecord;
use crate::config::PacingConfig;
use crate::remote::{DeviceApi, EntityFilter};
use crate::setup::fields::{FIELD_RESTORE_DATA, FIELD_RESTORE_FROM_BACKUP, VALUE_TRUE};
use crate::setup::setup_inputs;
use crate::setup::{FlowError, SetupSession};
use serde::Serialize;
use std::sync::Arc;

// =============================================================================
// Types
// =============================================================================

/// What a restore produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    /// Instance created by the restore, if it could be found
    pub restored_instance_id: Option<String>,
    /// Connection state of that instance
    pub device_state: Option<String>,
    /// Entities the restored instance offers that are not registered yet
    pub entity_count: Option<usize>,
}

/// Payload submitted as `restore_data`: compact JSON when the record
/// parses, otherwise the stored text unchanged.
pub fn restore_payload(record: &BackupRecord) -> String {
    match serde_json::from_str::<serde_json::Value>(&record.data) {
        Ok(value) => serde_json::to_string(&value).unwrap_or_else(|_| record.data.clone()),
        Err(e) => {
            tracing::warn!(driver_id = %record.driver_id, error = %e, "backup data is not valid JSON, using as-is");
            record.data.clone()
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives the restore sub-flow of a driver's setup wizard.
pub struct RestoreCoordinator {
    api: Arc<dyn DeviceApi>,
    pacing: PacingConfig,
}

impl RestoreCoordinator {
    pub fn new(api: Arc<dyn DeviceApi>, pacing: PacingConfig) -> Self {
        Self { api, pacing }
    }

    /// Restore `record` into the driver `driver_id`.
    ///
    /// A failure leaves the driver installed but unconfigured; nothing is
    /// rolled back.
    pub async fn restore(&self, driver_id: &str, record: &BackupRecord) -> Result<RestoreOutcome, FlowError> {
        tracing::info!(driver_id = %driver_id, "starting configuration restore");

        let session = SetupSession::new(self.api.clone(), driver_id, &self.pacing);
        let result = self.run(&session, record).await;
        session.end().await;

        let mut outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(driver_id = %driver_id, error = %e, "restore failed");
                return Err(e);
            }
        };

        if let Some(instance_id) = &outcome.restored_instance_id {
            match self.api.list_instance_entities(instance_id, EntityFilter::New).await {
                Ok(entities) => {
                    tracing::info!(instance_id = %instance_id, count = entities.len(), "restored instance offers new entities");
                    outcome.entity_count = Some(entities.len());
                }
                Err(e) => tracing::warn!(instance_id = %instance_id, error = %e, "could not list restored entities"),
            }
        }

        tracing::info!(
            driver_id = %driver_id,
            instance_id = ?outcome.restored_instance_id,
            device_state = ?outcome.device_state,
            "configuration restored"
        );
        Ok(outcome)
    }

    async fn run(&self, session: &SetupSession, record: &BackupRecord) -> Result<RestoreOutcome, FlowError> {
        session.begin(false).await?;

        session
            .advance(&setup_inputs(&[(FIELD_RESTORE_FROM_BACKUP, VALUE_TRUE)]))
            .await?;
        self.pacing.pause(self.pacing.restore_init_delay).await;

        let payload = restore_payload(record);
        session
            .advance(&setup_inputs(&[
                (FIELD_RESTORE_FROM_BACKUP, VALUE_TRUE),
                (FIELD_RESTORE_DATA, &payload),
            ]))
            .await?;
        self.pacing.pause(self.pacing.restore_apply_delay).await;

        Ok(self.verify(session.driver_id()).await)
    }

    /// Locate the instance the restore created. Failures are logged only.
    async fn verify(&self, driver_id: &str) -> RestoreOutcome {
        let mut outcome = RestoreOutcome::default();

        let instances = match self.api.list_enabled_instances().await {
            Ok(instances) => instances,
            Err(e) => {
                tracing::warn!(driver_id = %driver_id, error = %e, "post-restore instance lookup failed");
                return outcome;
            }
        };

        let Some(instance) = instances.into_iter().find(|i| i.driver_id == driver_id) else {
            tracing::warn!(driver_id = %driver_id, "no enabled instance found after restore");
            return outcome;
        };
        tracing::info!(driver_id = %driver_id, instance_id = %instance.integration_id, "found restored instance");
        outcome.restored_instance_id = Some(instance.integration_id.clone());

        match self.api.get_instance(&instance.integration_id).await {
            Ok(detail) => {
                let state = detail.device_state.unwrap_or_else(|| "UNKNOWN".to_string());
                tracing::info!(instance_id = %instance.integration_id, device_state = %state, "restored instance state");
                outcome.device_state = Some(state);
            }
            Err(e) => tracing::warn!(instance_id = %instance.integration_id, error = %e, "could not fetch restored instance"),
        }

        outcome
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimCall, SimDevice, SimFault, SimOp};
    use chrono::Utc;

    fn record(data: &str) -> BackupRecord {
        BackupRecord {
            driver_id: "psn".to_string(),
            data: data.to_string(),
            captured_at: Utc::now(),
        }
    }

    fn device() -> Arc<SimDevice> {
        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "2.1.0");
        device.set_driver_entities("psn", &["media_player.ps5", "remote.ps5"]);
        device
    }

    #[tokio::test]
    async fn test_restore_protocol_and_verification() {
        let device = device();
        let coordinator = RestoreCoordinator::new(device.clone(), PacingConfig::immediate());

        let outcome = coordinator
            .restore("psn", &record("{\n  \"devices\": [\n    1\n  ]\n}"))
            .await
            .unwrap();

        assert_eq!(outcome.restored_instance_id.as_deref(), Some("psn.main"));
        assert_eq!(outcome.device_state.as_deref(), Some("CONNECTED"));
        assert_eq!(outcome.entity_count, Some(2));
        assert!(device.calls().contains(&SimCall::ListEntities {
            instance_id: "psn.main".to_string(),
            filter: EntityFilter::New,
        }));

        let sent = device.inputs_sent("psn");
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], setup_inputs(&[("restore_from_backup", "true")]));
        assert_eq!(sent[1]["restore_from_backup"], "true");
        assert_eq!(sent[1]["restore_data"], r#"{"devices":[1]}"#);
        assert_eq!(device.setup_ends("psn"), 1);
        assert!(device.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_payload_is_sent_raw() {
        let device = device();
        let coordinator = RestoreCoordinator::new(device.clone(), PacingConfig::immediate());

        coordinator.restore("psn", &record("legacy-config: {broken")).await.unwrap();

        let sent = device.inputs_sent("psn");
        assert_eq!(sent[1]["restore_data"], "legacy-config: {broken");
    }

    #[tokio::test]
    async fn test_failed_step_ends_session_and_errors() {
        let device = device();
        device.inject_fault(SimOp::SendSetupInput, SimFault::api(500));
        let coordinator = RestoreCoordinator::new(device.clone(), PacingConfig::immediate());

        let result = coordinator.restore("psn", &record("{}")).await;
        assert!(result.is_err());
        assert_eq!(device.setup_ends("psn"), 1);
        assert!(device.instances().is_empty());
    }

    #[tokio::test]
    async fn test_verification_failure_is_not_fatal() {
        let device = device();
        device.inject_fault(SimOp::ListEnabledInstances, SimFault::transport());
        let coordinator = RestoreCoordinator::new(device.clone(), PacingConfig::immediate());

        let outcome = coordinator.restore("psn", &record("{}")).await.unwrap();
        assert_eq!(outcome.restored_instance_id, None);
        assert_eq!(device.setup_ends("psn"), 1);
    }
}
