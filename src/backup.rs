//! Backup Coordinator
//!
//! TigerStyle: Extract a driver's configuration through its own setup flow.
//!
//! Protocol:
//! 1. begin (reconfigure) and read the action page
//! 2. no `choice` dropdown: the driver cannot back up, stop
//! 3. advance with `{choice, action: "backup", backup_data: "[]"}`
//! 4. pause, read, take the `backup_data` textarea
//! 5. normalize the payload
//!
//! The session is ended exactly once on every path.

use crate::config::PacingConfig;
use crate::remote::DeviceApi;
use crate::setup::fields::{
    self, ACTION_BACKUP, BACKUP_DATA_PLACEHOLDER, FIELD_ACTION, FIELD_BACKUP_DATA, FIELD_CHOICE,
};
use crate::setup::setup_inputs;
use crate::setup::{FlowError, SetupSession};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// =============================================================================
// Types
// =============================================================================

/// A driver's configuration as captured by its setup flow.
///
/// `data` is driver-defined; it is normalized for storage but never
/// inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub driver_id: String,
    pub data: String,
    pub captured_at: DateTime<Utc>,
}

impl BackupRecord {
    /// Build a record from a raw payload, normalizing it.
    pub fn capture(driver_id: impl Into<String>, raw: &str) -> Self {
        Self {
            driver_id: driver_id.into(),
            data: normalize_payload(raw),
            captured_at: Utc::now(),
        }
    }
}

/// Normalize a backup payload to pretty-printed JSON.
///
/// Payloads that do not parse are unescaped once (`\n`, `\"`, `\\`) and
/// retried; if that fails too, the raw text is kept unchanged.
pub fn normalize_payload(raw: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        if let Ok(pretty) = serde_json::to_string_pretty(&value) {
            return pretty;
        }
    }

    let unescaped = raw
        .replace("\\n", "\n")
        .replace("\\\"", "\"")
        .replace("\\\\", "\\");
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&unescaped) {
        if let Ok(pretty) = serde_json::to_string_pretty(&value) {
            return pretty;
        }
    }

    tracing::warn!("backup payload is not JSON, keeping raw data");
    raw.to_string()
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives the backup sub-flow of a driver's setup wizard.
pub struct BackupCoordinator {
    api: Arc<dyn DeviceApi>,
    pacing: PacingConfig,
}

impl BackupCoordinator {
    pub fn new(api: Arc<dyn DeviceApi>, pacing: PacingConfig) -> Self {
        Self { api, pacing }
    }

    /// Capture a driver's configuration.
    ///
    /// Returns `Ok(None)` when the driver offers no backup action.
    pub async fn backup(&self, driver_id: &str) -> Result<Option<BackupRecord>, FlowError> {
        tracing::info!(driver_id = %driver_id, "starting configuration backup");

        let session = SetupSession::new(self.api.clone(), driver_id, &self.pacing);
        let result = self.run(&session).await;
        session.end().await;

        match &result {
            Ok(Some(record)) => {
                tracing::info!(driver_id = %driver_id, bytes = record.data.len(), "backup captured")
            }
            Ok(None) => tracing::info!(driver_id = %driver_id, "driver does not offer backup"),
            Err(e) => tracing::error!(driver_id = %driver_id, error = %e, "backup failed"),
        }
        result
    }

    async fn run(&self, session: &SetupSession) -> Result<Option<BackupRecord>, FlowError> {
        session.begin(true).await?;
        self.pacing.pause(self.pacing.step_delay).await;

        let page = session.read_settled().await?;
        let Some(choice) = fields::first_choice(&page) else {
            return Ok(None);
        };
        tracing::debug!(driver_id = %session.driver_id(), choice = %choice, "requesting backup");

        session
            .advance(&setup_inputs(&[
                (FIELD_CHOICE, &choice),
                (FIELD_ACTION, ACTION_BACKUP),
                (FIELD_BACKUP_DATA, BACKUP_DATA_PLACEHOLDER),
            ]))
            .await?;
        self.pacing.pause(self.pacing.backup_read_delay).await;

        let page = session.read_settled().await?;
        let raw = fields::textarea_value(&page, FIELD_BACKUP_DATA).ok_or_else(|| {
            FlowError::MissingField {
                driver_id: session.driver_id().to_string(),
                field: FIELD_BACKUP_DATA.to_string(),
            }
        })?;

        Ok(Some(BackupRecord::capture(session.driver_id(), &raw)))
    }
}

// =============================================================================
// Tests
// =============================================================================
