//! Backup Store
//!
//! TigerStyle: One JSON file, read-modify-write under a mutex.
//!
//! Writes go to `manager.json.tmp` and are renamed over `manager.json`, so
//! readers never see a half-written file and a crash mid-write leaves the
//! previous document intact.
//!
//! Layout of `manager.json`:
//!
//! ```text
//! {
//!   "version": "1.0",
//!   "backup_timestamp": "2026-10-18T02:00:04+00:00",
//!   "settings": { ... },
//!   "integrations": { "<driver_id>": { "data": "<json text>", "timestamp": "<iso-8601>" } },
//!   "notification_state": { "notified_updates": ["<driver_id>:<version>"] }
//! }
//! ```
//!
//! Files in the older `{ "backups": {...}, "last_updated": ... }` shape are
//! migrated on load.

use crate::backup::BackupRecord;
use crate::config::Settings;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Backup file name inside the data directory
pub const STORE_FILE_NAME: &str = "manager.json";

/// Current file format version
pub const STORE_FORMAT_VERSION: &str = "1.0";

/// Suffix of the file a save is staged in
const STORE_TMP_SUFFIX: &str = "tmp";

// =============================================================================
// Types
// =============================================================================

/// One persisted backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredBackup {
    /// Normalized payload (JSON text, or raw text when unparsable)
    pub data: String,
    /// ISO-8601 capture time
    pub timestamp: String,
}

/// Notifications already delivered, kept so each is sent once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationState {
    #[serde(default)]
    pub notified_updates: BTreeSet<String>,
}

/// What an import replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub integrations: usize,
    pub settings_restored: bool,
}

/// On-disk document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDocument {
    #[serde(default = "format_version")]
    pub version: String,
    #[serde(default)]
    pub backup_timestamp: Option<String>,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub integrations: BTreeMap<String, StoredBackup>,
    #[serde(default)]
    pub notification_state: NotificationState,
}

fn format_version() -> String {
    STORE_FORMAT_VERSION.to_string()
}

impl Default for StoreDocument {
    fn default() -> Self {
        Self {
            version: format_version(),
            backup_timestamp: None,
            settings: Value::Object(Default::default()),
            integrations: BTreeMap::new(),
            notification_state: NotificationState::default(),
        }
    }
}

impl StoreDocument {
    /// Parse a document, migrating the legacy shape.
    fn from_value(value: Value) -> Result<Self, StoreError> {
        let is_legacy = value.get("backups").is_some() && value.get("integrations").is_none();
        if !is_legacy {
            return serde_json::from_value(value).map_err(StoreError::InvalidStore);
        }

        tracing::info!("migrating backup file to current format");
        let integrations = value
            .get("backups")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::InvalidStore)?
            .unwrap_or_default();
        Ok(Self {
            version: format_version(),
            backup_timestamp: value
                .get("last_updated")
                .and_then(Value::as_str)
                .map(str::to_string),
            settings: Value::Object(Default::default()),
            integrations,
            notification_state: NotificationState::default(),
        })
    }

    /// Settings section, or defaults when none were saved.
    fn settings(&self) -> Result<Settings, StoreError> {
        match &self.settings {
            Value::Object(map) if map.is_empty() => Ok(Settings::default()),
            Value::Null => Ok(Settings::default()),
            value => serde_json::from_value(value.clone()).map_err(StoreError::InvalidStore),
        }
    }
}

/// Parse a stored timestamp; naive timestamps are read as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

// =============================================================================
// Store
// =============================================================================

/// File-backed store for backup records and settings.
pub struct BackupStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl BackupStore {
    /// Open (and create the directory for) the store in `data_dir`.
    pub async fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir).await?;
        Ok(Self {
            path: data_dir.join(STORE_FILE_NAME),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the whole document (empty document when the file is absent).
    pub async fn load(&self) -> Result<StoreDocument, StoreError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(StoreDocument::default());
        }
        let bytes = fs::read(&self.path).await?;
        let value: Value = serde_json::from_slice(&bytes).map_err(StoreError::InvalidStore)?;
        StoreDocument::from_value(value)
    }

    /// Replace the file atomically. Callers hold `write_lock`.
    async fn save(&self, mut document: StoreDocument) -> Result<(), StoreError> {
        document.version = format_version();
        document.backup_timestamp = Some(Utc::now().to_rfc3339());
        let bytes = serde_json::to_vec_pretty(&document)?;

        let staged = self.path.with_extension(format!("json.{}", STORE_TMP_SUFFIX));
        fs::write(&staged, &bytes).await?;
        if let Err(e) = fs::rename(&staged, &self.path).await {
            let _ = fs::remove_file(&staged).await;
            return Err(e.into());
        }
        Ok(())
    }

    /// Persist a backup record, replacing any previous one for the driver.
    pub async fn save_record(&self, record: &BackupRecord) -> Result<(), StoreError> {
        assert!(!record.driver_id.is_empty(), "driver_id must not be empty");

        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        document.integrations.insert(
            record.driver_id.clone(),
            StoredBackup {
                data: record.data.clone(),
                timestamp: record.captured_at.to_rfc3339(),
            },
        );
        self.save(document).await?;

        tracing::info!(driver_id = %record.driver_id, "backup saved");
        Ok(())
    }

    /// Stored backup for a driver.
    pub async fn get(&self, driver_id: &str) -> Result<Option<BackupRecord>, StoreError> {
        let document = self.load().await?;
        Ok(document
            .integrations
            .get(driver_id)
            .map(|stored| to_record(driver_id, stored)))
    }

    /// All stored backups, ordered by driver id.
    pub async fn list(&self) -> Result<Vec<BackupRecord>, StoreError> {
        let document = self.load().await?;
        Ok(document
            .integrations
            .iter()
            .map(|(id, stored)| to_record(id, stored))
            .collect())
    }

    /// Remove a driver's backup. Returns whether one existed.
    pub async fn delete(&self, driver_id: &str) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        let existed = document.integrations.remove(driver_id).is_some();
        if existed {
            self.save(document).await?;
            tracing::info!(driver_id = %driver_id, "backup deleted");
        }
        Ok(existed)
    }

    /// Persist settings alongside the backups.
    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        document.settings = serde_json::to_value(settings)?;
        self.save(document).await
    }

    /// Stored settings, or defaults when none were saved.
    pub async fn load_settings(&self) -> Result<Settings, StoreError> {
        self.load().await?.settings()
    }

    /// The whole document with the effective settings filled in.
    pub async fn export(&self) -> Result<StoreDocument, StoreError> {
        let mut document = self.load().await?;
        document.settings = serde_json::to_value(document.settings()?)?;
        Ok(document)
    }

    /// Replace the stored document with an exported one.
    ///
    /// The document must carry a `version`. Settings that do not parse are
    /// dropped and the current ones kept.
    pub async fn import(&self, value: Value) -> Result<ImportSummary, StoreError> {
        if value.get("version").is_none() {
            return Err(StoreError::MissingVersion);
        }
        let mut imported = StoreDocument::from_value(value)?;

        let _guard = self.write_lock.lock().await;
        let current = self.load().await?;
        let settings_restored = match &imported.settings {
            Value::Object(map) if !map.is_empty() => match imported.settings() {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unreadable settings in import");
                    false
                }
            },
            _ => false,
        };
        if !settings_restored {
            imported.settings = current.settings;
        }

        let summary = ImportSummary {
            integrations: imported.integrations.len(),
            settings_restored,
        };
        self.save(imported).await?;

        tracing::info!(integrations = summary.integrations, settings = summary.settings_restored, "backups imported");
        Ok(summary)
    }

    /// Whether a notification with this key was already delivered.
    pub async fn was_notified(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.load().await?.notification_state.notified_updates.contains(key))
    }

    /// Remember a delivered notification.
    pub async fn mark_notified(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        if document.notification_state.notified_updates.insert(key.to_string()) {
            self.save(document).await?;
        }
        Ok(())
    }
}

fn to_record(driver_id: &str, stored: &StoredBackup) -> BackupRecord {
    BackupRecord {
        driver_id: driver_id.to_string(),
        data: stored.data.clone(),
        captured_at: parse_timestamp(&stored.timestamp).unwrap_or_default(),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Backup store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid backup file: {0}")]
    InvalidStore(serde_json::Error),

    #[error("invalid backup file: missing version field")]
    MissingVersion,
}

// =============================================================================
// Tests
// =============================================================================
