//! Orchestrator
//!
//! TigerStyle: Every lifecycle entry point takes the lock first.
//!
//! Entry points:
//! - update a configured integration ([`UpdateTarget::Configured`])
//! - update a driver without an instance ([`UpdateTarget::Unconfigured`])
//! - install a driver from the registry ([`UpdateTarget::Fresh`])
//! - delete a driver
//! - back up one driver, all drivers, or on schedule
//!
//! A held lock rejects the call with [`OperationError::Busy`]; nothing is
//! queued. The scheduled backup skips its run instead.
//!
//! Read-only queries (version check, settings, stored backups) do not take
//! the lock. The store serializes its own writes.

use crate::backup::{BackupCoordinator, BackupRecord};
use crate::config::{PacingConfig, RemoteConfig, Settings};
use crate::notify::{Notification, Notifier};
use crate::lock::{LockBusy, LockHolder, OperationKind, OperationLock};
use crate::pipeline::{PipelinePlan, PipelineReport, UpdatePipeline, UpdateTarget};
use crate::registry::{update_available, BackupEligibility, Driver, Registry, RegistryError, RegistrySource};
use crate::release::ReleaseSource;
use crate::remote::{DeviceApi, DriverInfo, RemoteError, DRIVER_TYPE_CUSTOM};
use crate::schedule::{parse_backup_time, BackupSchedule};
use crate::setup::FlowError;
use crate::store::{BackupStore, ImportSummary, StoreDocument, StoreError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

// =============================================================================
// Types
// =============================================================================

/// Result of a backup-all run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackupSummary {
    pub backed_up: Vec<String>,
    /// `"driver (reason)"` entries
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl BackupSummary {
    /// Drivers a backup was attempted for.
    pub fn attempted(&self) -> usize {
        self.backed_up.len() + self.failed.len()
    }

    /// At least one backup, or nothing to back up.
    pub fn is_success(&self) -> bool {
        !self.backed_up.is_empty() || self.attempted() == 0
    }
}

/// What a scheduled backup tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScheduledBackup {
    /// Scheduled backups are turned off
    Disabled,
    /// Outside the backup window, or already done today
    NotDue,
    /// Another operation holds the lock; try again next tick
    SkippedBusy,
    Completed { summary: BackupSummary, success: bool },
}

/// Latest release of one installed driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub name: String,
    pub current: String,
    pub latest: String,
    pub has_update: bool,
}

/// Result of a version check, keyed by driver id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionReport {
    pub checked: usize,
    pub updates_available: usize,
    pub timestamp: DateTime<Utc>,
    pub versions: BTreeMap<String, VersionInfo>,
}

/// An installed custom driver and its update state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledIntegration {
    pub driver_id: String,
    pub name: String,
    pub version: Option<String>,
    /// First configured instance, if any
    pub instance_id: Option<String>,
    /// From the last version check
    pub latest_version: Option<String>,
    pub has_update: bool,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Top-level entry points, all serialized by one [`OperationLock`].
pub struct Orchestrator {
    api: Arc<dyn DeviceApi>,
    releases: Arc<dyn ReleaseSource>,
    registry: Arc<dyn RegistrySource>,
    store: Arc<BackupStore>,
    lock: OperationLock,
    pacing: PacingConfig,
    remote: RemoteConfig,
    schedule: Mutex<BackupSchedule>,
    versions: Mutex<Option<VersionReport>>,
    notifier: Notifier,
}

impl Orchestrator {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        releases: Arc<dyn ReleaseSource>,
        registry: Arc<dyn RegistrySource>,
        store: Arc<BackupStore>,
        pacing: PacingConfig,
        remote: RemoteConfig,
    ) -> Self {
        Self {
            api,
            releases,
            registry,
            store,
            lock: OperationLock::new(),
            pacing,
            remote,
            schedule: Mutex::new(BackupSchedule::new()),
            versions: Mutex::new(None),
            notifier: Notifier::new(),
        }
    }

    /// The lock shared by all entry points.
    pub fn lock(&self) -> &OperationLock {
        &self.lock
    }

    /// Which operation is running, if any.
    pub fn status(&self) -> Option<LockHolder> {
        self.lock.holder()
    }

    /// Stored settings (defaults when unreadable).
    pub async fn settings(&self) -> Settings {
        match self.store.load_settings().await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!(error = %e, "could not load settings, using defaults");
                Settings::default()
            }
        }
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), OperationError> {
        if parse_backup_time(&settings.backup_time).is_none() {
            return Err(OperationError::Invalid(format!(
                "backup_time must be HH:MM, got {:?}",
                settings.backup_time
            )));
        }
        self.store.save_settings(settings).await?;
        tracing::info!(backup_configs = settings.backup_configs, backup_time = %settings.backup_time, "settings saved");
        Ok(())
    }

    async fn load_registry(&self) -> Registry {
        match self.registry.load().await {
            Ok(registry) => registry,
            Err(e) => {
                tracing::warn!(error = %e, "registry unavailable, capabilities unknown");
                Registry::default()
            }
        }
    }

    fn pipeline(&self, settings: Settings) -> UpdatePipeline {
        UpdatePipeline::new(
            self.api.clone(),
            self.releases.clone(),
            self.store.clone(),
            self.pacing.clone(),
            self.remote.clone(),
            settings,
        )
    }

    async fn managed_driver(&self, driver_id: &str) -> Result<DriverInfo, OperationError> {
        let info = self
            .api
            .get_driver(driver_id)
            .await?
            .ok_or_else(|| OperationError::NotFound(format!("driver {}", driver_id)))?;
        if !info.is_custom() {
            return Err(OperationError::NotManageable(format!(
                "{} is managed by firmware updates",
                driver_id
            )));
        }
        Ok(info)
    }

    async fn resolve(&self, info: &DriverInfo) -> (Driver, String) {
        let registry = self.load_registry().await;
        let driver = Driver::resolve(info, registry.find(&info.driver_id, &info.display_name()));
        let repository = driver
            .repository
            .clone()
            .filter(|r| r.contains("github.com"))
            .unwrap_or_default();
        (driver, repository)
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Update the driver behind a configured integration instance.
    pub async fn update_integration(&self, instance_id: &str, tag: Option<String>) -> Result<PipelineReport, OperationError> {
        let guard = self.lock.try_acquire(OperationKind::Update, instance_id)?;

        let instance = self.api.get_instance(instance_id).await.map_err(|e| {
            if e.is_not_found() {
                OperationError::NotFound(format!("integration {}", instance_id))
            } else {
                OperationError::Remote(e)
            }
        })?;
        let info = self.managed_driver(&instance.driver_id).await?;
        let (driver, repository) = self.resolve(&info).await;
        if repository.is_empty() {
            return Err(OperationError::NotManageable(format!(
                "no GitHub repository found for {}",
                info.driver_id
            )));
        }

        let mut plan = PipelinePlan::new(
            driver,
            UpdateTarget::Configured {
                instance_id: instance_id.to_string(),
            },
            repository,
        );
        plan.tag = tag;

        let report = self.pipeline(self.settings().await).run(&plan, &guard).await;
        drop(guard);
        Ok(report)
    }

    /// Update an installed driver. Drivers with a configured instance go
    /// through the full pipeline; others only get the package replaced.
    pub async fn update_driver(&self, driver_id: &str, tag: Option<String>) -> Result<PipelineReport, OperationError> {
        let guard = self.lock.try_acquire(OperationKind::UpdateDriver, driver_id)?;

        let info = self.managed_driver(driver_id).await?;
        let (driver, repository) = self.resolve(&info).await;
        if repository.is_empty() {
            return Err(OperationError::NotManageable(format!(
                "no GitHub repository found for {}",
                driver_id
            )));
        }

        let target = match self
            .api
            .list_instances()
            .await?
            .into_iter()
            .find(|i| i.driver_id == driver_id)
        {
            Some(instance) => UpdateTarget::Configured {
                instance_id: instance.integration_id,
            },
            None => UpdateTarget::Unconfigured,
        };

        let mut plan = PipelinePlan::new(driver, target, repository);
        plan.tag = tag;

        let report = self.pipeline(self.settings().await).run(&plan, &guard).await;
        drop(guard);
        Ok(report)
    }

    /// Install a driver listed in the registry.
    pub async fn install(&self, registry_id: &str, tag: Option<String>) -> Result<PipelineReport, OperationError> {
        let guard = self.lock.try_acquire(OperationKind::Install, registry_id)?;

        let registry = self.registry.load().await?;
        let entry = registry
            .by_id(registry_id)
            .ok_or_else(|| OperationError::NotFound(format!("{} in registry", registry_id)))?;
        let repository = entry
            .repository
            .clone()
            .filter(|r| r.contains("github.com"))
            .ok_or_else(|| OperationError::NotManageable(format!("no GitHub repository for {}", registry_id)))?;

        let driver_id = entry.effective_driver_id().to_string();
        if self.api.get_driver(&driver_id).await?.is_some() {
            return Err(OperationError::NotManageable(format!("{} is already installed", driver_id)));
        }

        let driver = Driver {
            driver_id,
            name: entry.display_name(),
            installed_version: None,
            driver_type: Some(DRIVER_TYPE_CUSTOM.to_string()),
            supports_backup: entry.supports_backup,
            backup_min_version: entry.backup_min_version.clone(),
            migration_required_at: entry.migration_required_at.clone(),
            repository: Some(repository.clone()),
        };
        let mut plan = PipelinePlan::new(driver, UpdateTarget::Fresh, repository);
        plan.tag = tag;

        let report = self.pipeline(self.settings().await).run(&plan, &guard).await;
        drop(guard);
        Ok(report)
    }

    /// Remove a driver and its instances. Stored backups are kept.
    pub async fn delete_driver(&self, driver_id: &str) -> Result<(), OperationError> {
        let _guard = self.lock.try_acquire(OperationKind::Delete, driver_id)?;

        self.managed_driver(driver_id).await?;
        self.api.delete_driver(driver_id).await?;
        tracing::info!(driver_id = %driver_id, "driver deleted");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Backups
    // -------------------------------------------------------------------------

    /// Back up one driver and persist the record.
    pub async fn backup_driver(&self, driver_id: &str) -> Result<Option<BackupRecord>, OperationError> {
        let _guard = self.lock.try_acquire(OperationKind::Backup, driver_id)?;

        self.managed_driver(driver_id).await?;
        let coordinator = BackupCoordinator::new(self.api.clone(), self.pacing.clone());
        let Some(record) = coordinator.backup(driver_id).await? else {
            return Ok(None);
        };
        self.store.save_record(&record).await?;
        Ok(Some(record))
    }

    /// Back up every configured custom driver that supports it.
    pub async fn backup_all(&self) -> Result<BackupSummary, OperationError> {
        let _guard = self.lock.try_acquire(OperationKind::BackupAll, "all")?;
        self.backup_all_locked().await
    }

    /// Run the daily backup if it is due. Never waits for the lock.
    pub async fn scheduled_backup(&self, now: NaiveDateTime) -> ScheduledBackup {
        let settings = self.settings().await;
        if !settings.backup_configs {
            return ScheduledBackup::Disabled;
        }
        let due = self
            .schedule
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_due(&settings.backup_time, now);
        if !due {
            return ScheduledBackup::NotDue;
        }

        let Ok(_guard) = self.lock.try_acquire(OperationKind::ScheduledBackup, "all") else {
            tracing::info!("scheduled backup skipped, another operation is running");
            return ScheduledBackup::SkippedBusy;
        };

        tracing::info!(backup_time = %settings.backup_time, "starting scheduled backup");
        let summary = match self.backup_all_locked().await {
            Ok(summary) => summary,
            Err(e) => {
                tracing::error!(error = %e, "scheduled backup failed");
                return ScheduledBackup::Completed {
                    summary: BackupSummary::default(),
                    success: false,
                };
            }
        };

        let success = summary.is_success();
        if success {
            self.schedule
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .mark_done(now);
            tracing::info!(backed_up = summary.backed_up.len(), "scheduled backup completed");
        } else {
            tracing::warn!(failed = summary.failed.len(), "scheduled backup had no successful backups");
        }
        ScheduledBackup::Completed { summary, success }
    }

    async fn backup_all_locked(&self) -> Result<BackupSummary, OperationError> {
        let instances = self.api.list_instances().await?;
        let drivers: HashMap<String, DriverInfo> = self
            .api
            .list_drivers()
            .await?
            .into_iter()
            .map(|d| (d.driver_id.clone(), d))
            .collect();
        let registry = self.load_registry().await;

        let mut summary = BackupSummary::default();
        let mut seen = BTreeSet::new();
        let coordinator = BackupCoordinator::new(self.api.clone(), self.pacing.clone());

        for instance in instances {
            if !seen.insert(instance.driver_id.clone()) {
                continue;
            }
            let Some(info) = drivers.get(&instance.driver_id).filter(|d| d.is_custom()) else {
                continue;
            };
            let name = info.display_name();

            let Some(entry) = registry.find(&info.driver_id, &name) else {
                summary.skipped.push(format!("{} (not in registry)", name));
                continue;
            };
            let eligibility = BackupEligibility::check(
                entry.supports_backup,
                entry.backup_min_version.as_deref(),
                info.version.as_deref(),
            );
            if !eligibility.is_eligible() {
                summary.skipped.push(format!("{} ({})", name, eligibility.reason()));
                continue;
            }

            if summary.attempted() > 0 {
                self.pacing.pause(self.pacing.between_drivers_delay).await;
            }
            match coordinator.backup(&info.driver_id).await {
                Ok(Some(record)) => match self.store.save_record(&record).await {
                    Ok(()) => summary.backed_up.push(name),
                    Err(e) => {
                        tracing::error!(driver_id = %info.driver_id, error = %e, "could not save backup");
                        summary.failed.push(name);
                    }
                },
                Ok(None) | Err(_) => summary.failed.push(name),
            }
        }

        let settings = self.settings().await;
        if let Err(e) = self.store.save_settings(&settings).await {
            tracing::warn!(error = %e, "could not save settings with backups");
        }

        tracing::info!(
            backed_up = summary.backed_up.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "backup-all finished"
        );
        Ok(summary)
    }

    pub async fn get_backup(&self, driver_id: &str) -> Result<Option<BackupRecord>, OperationError> {
        Ok(self.store.get(driver_id).await?)
    }

    pub async fn list_backups(&self) -> Result<Vec<BackupRecord>, OperationError> {
        Ok(self.store.list().await?)
    }

    /// Remove a stored backup. Returns whether one existed.
    pub async fn delete_backup(&self, driver_id: &str) -> Result<bool, OperationError> {
        Ok(self.store.delete(driver_id).await?)
    }

    /// Every stored backup plus the current settings.
    pub async fn export_backups(&self) -> Result<StoreDocument, OperationError> {
        Ok(self.store.export().await?)
    }

    /// Replace stored backups (and settings, when present) with an export.
    pub async fn import_backups(&self, document: Value) -> Result<ImportSummary, OperationError> {
        match self.store.import(document).await {
            Ok(summary) => Ok(summary),
            Err(StoreError::MissingVersion) => {
                Err(OperationError::Invalid("backup file is missing its version field".to_string()))
            }
            Err(StoreError::InvalidStore(e)) => Err(OperationError::Invalid(format!("invalid backup file: {}", e))),
            Err(e) => Err(e.into()),
        }
    }

    // -------------------------------------------------------------------------
    // Versions
    // -------------------------------------------------------------------------

    /// Look up the latest release of every installed custom driver, cache
    /// the result and notify about new updates.
    pub async fn check_versions(&self) -> Result<VersionReport, OperationError> {
        let drivers = self.api.list_drivers().await?;
        let registry = self.load_registry().await;

        let mut versions = BTreeMap::new();
        for info in drivers.iter().filter(|d| d.is_custom()) {
            let driver = Driver::resolve(info, registry.find(&info.driver_id, &info.display_name()));
            let Some(repository) = driver.repository.as_deref().filter(|r| r.contains("github.com")) else {
                continue;
            };
            let latest = match self.releases.latest_tag(repository).await {
                Ok(tag) => tag,
                Err(e) => {
                    tracing::debug!(driver_id = %info.driver_id, error = %e, "version lookup failed");
                    continue;
                }
            };
            let current = info.version.clone().unwrap_or_default();
            versions.insert(
                info.driver_id.clone(),
                VersionInfo {
                    name: driver.name.clone(),
                    has_update: update_available(&current, &latest),
                    current,
                    latest,
                },
            );
        }

        let report = VersionReport {
            checked: versions.len(),
            updates_available: versions.values().filter(|v| v.has_update).count(),
            timestamp: Utc::now(),
            versions,
        };
        tracing::info!(checked = report.checked, updates = report.updates_available, "version check finished");
        *self.versions.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(report.clone());

        self.notify_updates(&report).await;
        Ok(report)
    }

    /// Result of the last version check.
    pub fn cached_versions(&self) -> Option<VersionReport> {
        self.versions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn updates_count(&self) -> usize {
        self.cached_versions().map_or(0, |report| report.updates_available)
    }

    /// Installed custom drivers joined with the last version check.
    pub async fn installed_integrations(&self) -> Result<Vec<InstalledIntegration>, OperationError> {
        let instances = self.api.list_instances().await?;
        let drivers = self.api.list_drivers().await?;
        let cached = self.cached_versions();

        Ok(drivers
            .into_iter()
            .filter(|d| d.is_custom())
            .map(|info| {
                let checked = cached.as_ref().and_then(|r| r.versions.get(&info.driver_id));
                InstalledIntegration {
                    name: info.display_name(),
                    instance_id: instances
                        .iter()
                        .find(|i| i.driver_id == info.driver_id)
                        .map(|i| i.integration_id.clone()),
                    latest_version: checked.map(|v| v.latest.clone()),
                    has_update: checked.is_some_and(|v| v.has_update),
                    driver_id: info.driver_id,
                    version: info.version,
                }
            })
            .collect())
    }

    /// Send one notification per driver and release.
    async fn notify_updates(&self, report: &VersionReport) {
        let settings = self.settings().await.notifications;
        if !settings.is_any_enabled() || !settings.triggers.integration_update_available {
            return;
        }

        for (driver_id, info) in report.versions.iter().filter(|(_, v)| v.has_update) {
            let key = format!("{}:{}", driver_id, info.latest);
            match self.store.was_notified(&key).await {
                Ok(false) => {}
                Ok(true) => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "could not read notification state");
                    continue;
                }
            }
            let notification = Notification::update_available(driver_id, &info.name, &info.current, &info.latest);
            if self.notifier.send_all(&settings, &notification).await > 0 {
                if let Err(e) = self.store.mark_notified(&key).await {
                    tracing::warn!(key = %key, error = %e, "could not record notification");
                }
            }
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Why an entry point did not run (or did not finish).
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("another operation is in progress: {holder}")]
    Busy { holder: LockHolder },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not manageable: {0}")]
    NotManageable(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    Flow(#[from] FlowError),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<LockBusy> for OperationError {
    fn from(busy: LockBusy) -> Self {
        Self::Busy { holder: busy.holder }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistryEntry, StaticRegistry};
    use crate::sim::{SimDevice, SimReleases};
    use chrono::NaiveDate;
    use tempfile::TempDir;

    async fn orchestrator(device: &Arc<SimDevice>, entries: Vec<RegistryEntry>) -> (Orchestrator, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(BackupStore::open(dir.path()).await.unwrap());
        let orchestrator = Orchestrator::new(
            device.clone(),
            Arc::new(SimReleases::new("v2.0.0")),
            Arc::new(StaticRegistry(Registry::new(entries))),
            store,
            PacingConfig::immediate(),
            RemoteConfig::new("192.168.1.20"),
        );
        (orchestrator, dir)
    }

    fn entry(id: &str, supports_backup: bool) -> RegistryEntry {
        RegistryEntry {
            id: id.to_string(),
            repository: Some(format!("https://github.com/owner/uc-intg-{}", id)),
            supports_backup,
            ..Default::default()
        }
    }

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, 18).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    #[tokio::test]
    async fn test_busy_rejects_immediately() {
        let device = Arc::new(SimDevice::new());
        let (orchestrator, _dir) = orchestrator(&device, vec![]).await;

        let _held = orchestrator.lock().try_acquire(OperationKind::Update, "psn.main").unwrap();
        let result = orchestrator.delete_driver("psn").await;
        assert!(matches!(result, Err(OperationError::Busy { ref holder }) if holder.target == "psn.main"));
        assert!(device.calls().is_empty());
    }

    #[tokio::test]
    async fn test_lock_released_after_error() {
        let device = Arc::new(SimDevice::new());
        let (orchestrator, _dir) = orchestrator(&device, vec![]).await;

        assert!(matches!(orchestrator.delete_driver("missing").await, Err(OperationError::NotFound(_))));
        assert!(orchestrator.status().is_none());
    }

    #[tokio::test]
    async fn test_non_custom_driver_not_manageable() {
        let device = Arc::new(SimDevice::new());
        device.add_driver_info(DriverInfo {
            driver_id: "hass".to_string(),
            driver_type: Some("LOCAL".to_string()),
            ..Default::default()
        });
        let (orchestrator, _dir) = orchestrator(&device, vec![]).await;

        assert!(matches!(
            orchestrator.delete_driver("hass").await,
            Err(OperationError::NotManageable(_))
        ));
        assert_eq!(device.drivers().len(), 1);
    }

    #[tokio::test]
    async fn test_install_unknown_registry_id() {
        let device = Arc::new(SimDevice::new());
        let (orchestrator, _dir) = orchestrator(&device, vec![entry("psn", false)]).await;
        assert!(matches!(
            orchestrator.install("denon", None).await,
            Err(OperationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_backup_all_skips_and_records() {
        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "1.0.0");
        device.add_driver("denon", "1.0.0");
        device.add_driver("unknown", "1.0.0");
        device.add_instance("psn", "psn.main", &[]);
        device.add_instance("denon", "denon.main", &[]);
        device.add_instance("unknown", "unknown.main", &[]);
        // psn offers backup, denon's flow has no choice field
        device.set_responder("psn", |req: &crate::sim::SetupRequest| match req {
            crate::sim::SetupRequest::Begin { .. } => crate::sim::page(
                "WAIT_USER_ACTION",
                serde_json::json!([crate::sim::dropdown_field("choice", "ps5")]),
            ),
            crate::sim::SetupRequest::Advance { .. } => crate::sim::page(
                "WAIT_USER_ACTION",
                serde_json::json!([crate::sim::textarea_field("backup_data", "{\"a\":1}")]),
            ),
        });

        let mut denon = entry("denon", true);
        denon.backup_min_version = Some("0.5".to_string());
        let (orchestrator, _dir) =
            orchestrator(&device, vec![entry("psn", true), denon]).await;

        let summary = orchestrator.backup_all().await.unwrap();
        assert_eq!(summary.backed_up, vec!["psn"]);
        assert_eq!(summary.failed, vec!["denon"]);
        assert_eq!(summary.skipped, vec!["unknown (not in registry)"]);
        assert!(summary.is_success());
        assert!(orchestrator.get_backup("psn").await.unwrap().is_some());
        assert!(device.open_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_scheduled_backup_window_and_busy() {
        let device = Arc::new(SimDevice::new());
        let (orchestrator, _dir) = orchestrator(&device, vec![]).await;

        assert_eq!(orchestrator.scheduled_backup(at(2, 0)).await, ScheduledBackup::Disabled);

        let settings = Settings {
            backup_configs: true,
            ..Settings::default()
        };
        orchestrator.save_settings(&settings).await.unwrap();
        assert_eq!(orchestrator.scheduled_backup(at(9, 0)).await, ScheduledBackup::NotDue);

        {
            let _held = orchestrator.lock().try_acquire(OperationKind::Install, "psn").unwrap();
            assert_eq!(orchestrator.scheduled_backup(at(2, 1)).await, ScheduledBackup::SkippedBusy);
        }

        // nothing installed counts as success and marks the day done
        assert_eq!(
            orchestrator.scheduled_backup(at(2, 2)).await,
            ScheduledBackup::Completed {
                summary: BackupSummary::default(),
                success: true
            }
        );
        assert_eq!(orchestrator.scheduled_backup(at(2, 3)).await, ScheduledBackup::NotDue);
    }

    #[tokio::test]
    async fn test_check_versions_and_installed_listing() {
        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "1.5.0");
        device.add_driver("denon", "1.0.0");
        device.add_instance("psn", "psn.main", &[]);
        device.add_driver_info(DriverInfo {
            driver_id: "hass".to_string(),
            driver_type: Some("LOCAL".to_string()),
            ..Default::default()
        });
        // denon has no repository, so it cannot be checked
        let denon = RegistryEntry {
            id: "denon".to_string(),
            ..Default::default()
        };
        let (orchestrator, _dir) = orchestrator(&device, vec![entry("psn", true), denon]).await;
        assert_eq!(orchestrator.updates_count(), 0);

        let report = orchestrator.check_versions().await.unwrap();
        assert_eq!(report.checked, 1);
        assert_eq!(report.updates_available, 1);
        let psn = &report.versions["psn"];
        assert_eq!((psn.current.as_str(), psn.latest.as_str()), ("1.5.0", "v2.0.0"));
        assert!(psn.has_update);
        assert_eq!(orchestrator.updates_count(), 1);

        let installed = orchestrator.installed_integrations().await.unwrap();
        assert_eq!(installed.len(), 2);
        let psn = installed.iter().find(|i| i.driver_id == "psn").unwrap();
        assert_eq!(psn.instance_id.as_deref(), Some("psn.main"));
        assert_eq!(psn.latest_version.as_deref(), Some("v2.0.0"));
        assert!(psn.has_update);
        let denon = installed.iter().find(|i| i.driver_id == "denon").unwrap();
        assert_eq!(denon.instance_id, None);
        assert!(!denon.has_update);
    }

    #[tokio::test]
    async fn test_update_notification_sent_once_per_release() {
        let mut server = mockito::Server::new_async().await;
        let hook = server
            .mock("POST", "/hook")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "driver_id": "psn",
                "latest_version": "v2.0.0"
            })))
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let device = Arc::new(SimDevice::new());
        device.add_driver("psn", "1.5.0");
        let (orchestrator, _dir) = orchestrator(&device, vec![entry("psn", true)]).await;
        let mut settings = Settings::default();
        settings.notifications.webhook.enabled = true;
        settings.notifications.webhook.url = format!("{}/hook", server.url());
        orchestrator.save_settings(&settings).await.unwrap();

        orchestrator.check_versions().await.unwrap();
        orchestrator.check_versions().await.unwrap();

        hook.assert_async().await;
    }

    #[tokio::test]
    async fn test_settings_validation() {
        let device = Arc::new(SimDevice::new());
        let (orchestrator, _dir) = orchestrator(&device, vec![]).await;

        let bad = Settings {
            backup_time: "25:99".to_string(),
            ..Settings::default()
        };
        assert!(matches!(orchestrator.save_settings(&bad).await, Err(OperationError::Invalid(_))));
        assert_eq!(orchestrator.settings().await, Settings::default());
    }

    #[tokio::test]
    async fn test_backup_delete_export_import() {
        let device = Arc::new(SimDevice::new());
        let (orchestrator, _dir) = orchestrator(&device, vec![]).await;

        let imported = orchestrator
            .import_backups(serde_json::json!({
                "version": "1.0",
                "integrations": {"psn": {"data": "{}", "timestamp": "2026-10-18T02:00:00+00:00"}}
            }))
            .await
            .unwrap();
        assert_eq!(imported.integrations, 1);
        assert!(!imported.settings_restored);

        let exported = orchestrator.export_backups().await.unwrap();
        assert!(exported.integrations.contains_key("psn"));
        assert_eq!(exported.settings["auto_register_entities"], true);

        assert!(orchestrator.delete_backup("psn").await.unwrap());
        assert!(!orchestrator.delete_backup("psn").await.unwrap());
        assert!(orchestrator.list_backups().await.unwrap().is_empty());

        assert!(matches!(
            orchestrator.import_backups(serde_json::json!({"integrations": {}})).await,
            Err(OperationError::Invalid(_))
        ));
    }
}
