//! Update Pipeline
//!
//! TigerStyle: Ordered stages, explicit outcomes, one terminal report.
//!
//! ```text
//! CAPTURE_ENTITIES → BACKUP → DOWNLOAD_ARTIFACT → DELETE_OLD_DRIVER
//!   → INSTALL_NEW_DRIVER → AWAIT_READY → RESTORE → DETECT_MIGRATION
//!   → APPLY_MIGRATION → REGISTER_ENTITIES → DONE → END
//! ```
//!
//! Failures before the old driver is deleted abort the run (`failed`).
//! Once the new driver is installed nothing is rolled back: later
//! problems are recorded as warnings (`succeeded_with_warnings`).
//! `END` is always recorded. The caller holds the [`OperationGuard`] for
//! the whole run and releases it when the report comes back.

use crate::backup::{BackupCoordinator, BackupRecord};
use crate::config::{PacingConfig, RemoteConfig, Settings};
use crate::lock::OperationGuard;
use crate::migration::{apply_mappings, MigrationCoordinator, MigrationRequest};
use crate::registry::Driver;
use crate::release::{ReleaseArtifact, ReleaseSource, ASSET_PATTERN_DEFAULT};
use crate::remote::DeviceApi;
use crate::restore::RestoreCoordinator;
use crate::store::BackupStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Types
// =============================================================================

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    CaptureEntities,
    Backup,
    DownloadArtifact,
    DeleteOldDriver,
    InstallNewDriver,
    AwaitReady,
    Restore,
    DetectMigration,
    ApplyMigration,
    RegisterEntities,
    Done,
    End,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a stage ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    Completed(Option<String>),
    Skipped(String),
    Warning(String),
    Failed(String),
}

/// One executed (or skipped) stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    SucceededWithWarnings,
    Failed,
}

/// Everything a caller learns about a run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub driver_id: String,
    pub status: PipelineStatus,
    /// Human-readable summary
    pub reason: String,
    pub stages: Vec<StageRecord>,
    pub warnings: Vec<String>,
    pub backup_captured: bool,
    pub restored_instance_id: Option<String>,
    pub previous_version: Option<String>,
    pub installed_version: Option<String>,
    /// Entity ids rewritten by migration
    pub migrated_entities: usize,
    /// Entity ids re-registered on the new instance
    pub registered_entities: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineReport {
    fn new(driver_id: &str, previous_version: Option<String>) -> Self {
        Self {
            driver_id: driver_id.to_string(),
            status: PipelineStatus::Succeeded,
            reason: String::new(),
            stages: Vec::new(),
            warnings: Vec::new(),
            backup_captured: false,
            restored_instance_id: None,
            previous_version,
            installed_version: None,
            migrated_entities: 0,
            registered_entities: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    fn record(&mut self, stage: Stage, outcome: StageOutcome) {
        match &outcome {
            StageOutcome::Completed(detail) => {
                tracing::info!(driver_id = %self.driver_id, stage = %stage, detail = ?detail, "stage completed")
            }
            StageOutcome::Skipped(reason) => {
                tracing::info!(driver_id = %self.driver_id, stage = %stage, reason = %reason, "stage skipped")
            }
            StageOutcome::Warning(message) => {
                tracing::warn!(driver_id = %self.driver_id, stage = %stage, message = %message, "stage warning");
                self.warnings.push(format!("{}: {}", stage, message));
            }
            StageOutcome::Failed(message) => {
                tracing::error!(driver_id = %self.driver_id, stage = %stage, message = %message, "stage failed")
            }
        }
        self.stages.push(StageRecord { stage, outcome });
    }

    fn completed(&mut self, stage: Stage) {
        self.record(stage, StageOutcome::Completed(None));
    }

    fn completed_with(&mut self, stage: Stage, detail: impl Into<String>) {
        self.record(stage, StageOutcome::Completed(Some(detail.into())));
    }

    fn skipped(&mut self, stage: Stage, reason: impl Into<String>) {
        self.record(stage, StageOutcome::Skipped(reason.into()));
    }

    fn warning(&mut self, stage: Stage, message: impl Into<String>) {
        self.record(stage, StageOutcome::Warning(message.into()));
    }

    fn fail(&mut self, stage: Stage, message: impl Into<String>) -> Abort {
        let message = message.into();
        self.record(stage, StageOutcome::Failed(message.clone()));
        Abort(format!("{} failed: {}", stage, message))
    }

    fn finish(&mut self, result: Result<(), Abort>) {
        match result {
            Err(Abort(reason)) => {
                self.status = PipelineStatus::Failed;
                self.reason = reason;
            }
            Ok(()) => {
                self.completed(Stage::Done);
                let version = self.installed_version.as_deref().unwrap_or("latest");
                if self.warnings.is_empty() {
                    self.status = PipelineStatus::Succeeded;
                    self.reason = format!("updated {} to {}", self.driver_id, version);
                } else {
                    self.status = PipelineStatus::SucceededWithWarnings;
                    self.reason = format!(
                        "updated {} to {} with {} warning(s): {}",
                        self.driver_id,
                        version,
                        self.warnings.len(),
                        self.warnings.join("; ")
                    );
                }
            }
        }
        self.completed(Stage::End);
        self.finished_at = Some(Utc::now());
    }

    /// Outcome recorded for a stage, if it ran.
    pub fn outcome(&self, stage: Stage) -> Option<&StageOutcome> {
        self.stages.iter().find(|r| r.stage == stage).map(|r| &r.outcome)
    }

    pub fn is_success(&self) -> bool {
        self.status != PipelineStatus::Failed
    }
}

/// Short-circuits the remaining stages.
struct Abort(String);

/// What is being updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateTarget {
    /// Driver with a configured instance: backup, restore, migrate, re-register
    Configured { instance_id: String },
    /// Driver installed but never configured: replace the package only
    Unconfigured,
    /// Driver not installed yet: download, install, await ready
    Fresh,
}

/// Input of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub driver: Driver,
    pub target: UpdateTarget,
    /// Repository the new package is downloaded from
    pub repository_url: String,
    pub asset_pattern: String,
    /// Release tag to install; latest when `None`
    pub tag: Option<String>,
}

impl PipelinePlan {
    pub fn new(driver: Driver, target: UpdateTarget, repository_url: impl Into<String>) -> Self {
        Self {
            driver,
            target,
            repository_url: repository_url.into(),
            asset_pattern: ASSET_PATTERN_DEFAULT.to_string(),
            tag: None,
        }
    }
}

/// State carried between stages of one run.
#[derive(Default)]
struct RunState {
    captured_entities: Vec<String>,
    backup: Option<BackupRecord>,
    artifact: Option<ReleaseArtifact>,
    migration_executed: bool,
}

// =============================================================================
// Pipeline
// =============================================================================

/// Composes backup, package replacement, restore, migration and
/// re-registration into one run.
pub struct UpdatePipeline {
    api: Arc<dyn DeviceApi>,
    releases: Arc<dyn ReleaseSource>,
    store: Arc<BackupStore>,
    pacing: PacingConfig,
    remote: RemoteConfig,
    settings: Settings,
}

impl UpdatePipeline {
    pub fn new(
        api: Arc<dyn DeviceApi>,
        releases: Arc<dyn ReleaseSource>,
        store: Arc<BackupStore>,
        pacing: PacingConfig,
        remote: RemoteConfig,
        settings: Settings,
    ) -> Self {
        Self {
            api,
            releases,
            store,
            pacing,
            remote,
            settings,
        }
    }

    /// Execute a plan. Never returns an error: the outcome is in the report.
    pub async fn run(&self, plan: &PipelinePlan, guard: &OperationGuard) -> PipelineReport {
        assert!(!plan.repository_url.is_empty(), "repository_url must not be empty");

        tracing::info!(
            driver_id = %plan.driver.driver_id,
            target = ?plan.target,
            operation = %guard.holder().kind,
            "pipeline started"
        );

        let mut report = PipelineReport::new(&plan.driver.driver_id, plan.driver.installed_version.clone());
        let mut state = RunState::default();
        let result = self.execute(plan, &mut state, &mut report).await;
        report.finish(result);

        tracing::info!(
            driver_id = %report.driver_id,
            status = ?report.status,
            reason = %report.reason,
            "pipeline finished"
        );
        report
    }

    async fn execute(&self, plan: &PipelinePlan, state: &mut RunState, report: &mut PipelineReport) -> Result<(), Abort> {
        self.capture_entities(plan, state, report).await?;
        self.backup(plan, state, report).await?;
        self.download(plan, state, report).await?;
        self.delete_old_driver(plan, report).await?;
        self.install(state, report).await?;
        self.await_ready(plan, state, report).await;

        if !self.restore(plan, state, report).await {
            return Ok(());
        }
        self.migrate(plan, state, report).await;
        self.register_entities(state, report).await;
        Ok(())
    }

    async fn capture_entities(&self, plan: &PipelinePlan, state: &mut RunState, report: &mut PipelineReport) -> Result<(), Abort> {
        let UpdateTarget::Configured { instance_id } = &plan.target else {
            report.skipped(Stage::CaptureEntities, "no configured instance");
            return Ok(());
        };

        match self.api.get_instance(instance_id).await {
            Ok(instance) => {
                state.captured_entities = instance.configured_entities;
                report.completed_with(
                    Stage::CaptureEntities,
                    format!("{} configured entities", state.captured_entities.len()),
                );
                Ok(())
            }
            Err(e) => Err(report.fail(Stage::CaptureEntities, format!("could not read instance {}: {}", instance_id, e))),
        }
    }

    async fn backup(&self, plan: &PipelinePlan, state: &mut RunState, report: &mut PipelineReport) -> Result<(), Abort> {
        if !matches!(plan.target, UpdateTarget::Configured { .. }) {
            report.skipped(Stage::Backup, "nothing to preserve");
            return Ok(());
        }

        let mandatory = plan.driver.backup_mandatory();
        if !mandatory && plan.driver.supports_backup {
            let eligibility = plan.driver.backup_eligibility();
            tracing::info!(driver_id = %plan.driver.driver_id, reason = %eligibility.reason(), "backup not mandatory");
        }

        let coordinator = BackupCoordinator::new(self.api.clone(), self.pacing.clone());
        match coordinator.backup(&plan.driver.driver_id).await {
            Ok(Some(record)) => {
                if let Err(e) = self.store.save_record(&record).await {
                    report.warning(Stage::Backup, format!("backup captured but not saved: {}", e));
                } else {
                    report.completed_with(Stage::Backup, format!("{} bytes", record.data.len()));
                }
                report.backup_captured = true;
                state.backup = Some(record);
                Ok(())
            }
            Ok(None) if mandatory => Err(report.fail(Stage::Backup, "backup required but the driver returned no data")),
            Ok(None) => {
                report.skipped(Stage::Backup, "driver does not offer backup");
                Ok(())
            }
            Err(e) if mandatory => Err(report.fail(Stage::Backup, format!("backup required: {}", e))),
            Err(e) => {
                report.warning(Stage::Backup, format!("best-effort backup failed: {}", e));
                Ok(())
            }
        }
    }

    async fn download(&self, plan: &PipelinePlan, state: &mut RunState, report: &mut PipelineReport) -> Result<(), Abort> {
        match self
            .releases
            .fetch_asset(&plan.repository_url, &plan.asset_pattern, plan.tag.as_deref())
            .await
        {
            Ok(artifact) => {
                report.completed_with(
                    Stage::DownloadArtifact,
                    format!("{} ({} bytes, {})", artifact.filename, artifact.bytes.len(), artifact.tag_name),
                );
                state.artifact = Some(artifact);
                Ok(())
            }
            Err(e) => Err(report.fail(Stage::DownloadArtifact, e.to_string())),
        }
    }

    async fn delete_old_driver(&self, plan: &PipelinePlan, report: &mut PipelineReport) -> Result<(), Abort> {
        if plan.target == UpdateTarget::Fresh {
            report.skipped(Stage::DeleteOldDriver, "not installed");
            return Ok(());
        }

        match self.api.delete_driver(&plan.driver.driver_id).await {
            Ok(()) => {
                report.completed(Stage::DeleteOldDriver);
                Ok(())
            }
            Err(e) if e.is_transport() || e.is_auth() => {
                Err(report.fail(Stage::DeleteOldDriver, format!("connection error: {}", e)))
            }
            Err(e) if e.is_not_found() => {
                report.skipped(Stage::DeleteOldDriver, "already removed");
                Ok(())
            }
            Err(e) => {
                report.warning(Stage::DeleteOldDriver, format!("delete failed, continuing: {}", e));
                Ok(())
            }
        }
    }

    async fn install(&self, state: &mut RunState, report: &mut PipelineReport) -> Result<(), Abort> {
        let Some(artifact) = state.artifact.as_ref() else {
            return Err(report.fail(Stage::InstallNewDriver, "no artifact downloaded"));
        };

        match self
            .api
            .install_driver(artifact.bytes.clone(), &artifact.filename)
            .await
        {
            Ok(_) => {
                report.completed_with(Stage::InstallNewDriver, artifact.filename.clone());
                self.pacing.pause(self.pacing.install_settle_delay).await;
                Ok(())
            }
            Err(e) => Err(report.fail(Stage::InstallNewDriver, e.to_string())),
        }
    }

    async fn await_ready(&self, plan: &PipelinePlan, state: &RunState, report: &mut PipelineReport) {
        let driver_id = &plan.driver.driver_id;
        let fallback_version = state.artifact.as_ref().map(|a| a.version().to_string());

        for attempt in 1..=self.pacing.driver_ready_poll_attempts {
            match self.api.list_drivers().await {
                Ok(drivers) => {
                    if let Some(driver) = drivers.into_iter().find(|d| &d.driver_id == driver_id) {
                        report.installed_version = driver.version.or(fallback_version);
                        report.completed_with(Stage::AwaitReady, format!("ready after {} poll(s)", attempt));
                        self.pacing.pause(self.pacing.driver_ready_settle_delay).await;
                        return;
                    }
                }
                Err(e) => tracing::debug!(driver_id = %driver_id, attempt, error = %e, "driver list poll failed"),
            }
            if attempt < self.pacing.driver_ready_poll_attempts {
                self.pacing.pause(self.pacing.driver_ready_poll_interval).await;
            }
        }

        report.installed_version = fallback_version;
        report.warning(
            Stage::AwaitReady,
            format!(
                "driver did not appear after {} polls",
                self.pacing.driver_ready_poll_attempts
            ),
        );
    }

    /// Returns whether the later stages should run.
    async fn restore(&self, plan: &PipelinePlan, state: &RunState, report: &mut PipelineReport) -> bool {
        if !matches!(plan.target, UpdateTarget::Configured { .. }) {
            report.skipped(Stage::Restore, "nothing to restore");
            report.skipped(Stage::DetectMigration, "no configured instance");
            report.skipped(Stage::ApplyMigration, "no configured instance");
            report.skipped(Stage::RegisterEntities, "no configured instance");
            return false;
        }

        let Some(record) = state.backup.as_ref() else {
            // the delete stage removed the instance along with the old driver
            report.warning(
                Stage::Restore,
                "no backup captured, the instance must be reconfigured manually",
            );
            return true;
        };

        let coordinator = RestoreCoordinator::new(self.api.clone(), self.pacing.clone());
        match coordinator.restore(&plan.driver.driver_id, record).await {
            Ok(outcome) => {
                report.restored_instance_id = outcome.restored_instance_id.clone();
                report.completed_with(
                    Stage::Restore,
                    format!(
                        "instance {} ({})",
                        outcome.restored_instance_id.as_deref().unwrap_or("unknown"),
                        outcome.device_state.as_deref().unwrap_or("UNKNOWN")
                    ),
                );
                true
            }
            Err(e) => {
                report.warning(
                    Stage::Restore,
                    format!("restore failed, reconfigure the integration manually: {}", e),
                );
                report.skipped(Stage::DetectMigration, "restore failed");
                report.skipped(Stage::ApplyMigration, "restore failed");
                report.skipped(Stage::RegisterEntities, "restore failed");
                false
            }
        }
    }

    async fn migrate(&self, plan: &PipelinePlan, state: &mut RunState, report: &mut PipelineReport) {
        let current = match self.api.get_driver(&plan.driver.driver_id).await {
            Ok(Some(driver)) => driver.version.or_else(|| report.installed_version.clone()),
            _ => report.installed_version.clone(),
        };

        if !plan.driver.migration_applies(current.as_deref()) {
            let reason = match plan.driver.migration_required_at.as_deref() {
                Some(b) if !b.is_empty() => format!("upgrade does not cross boundary {}", b),
                _ => "no migration boundary declared".to_string(),
            };
            report.skipped(Stage::DetectMigration, reason);
            report.skipped(Stage::ApplyMigration, "not required");
            return;
        }
        report.completed_with(
            Stage::DetectMigration,
            format!(
                "{} → {} crosses {}",
                plan.driver.installed_version.as_deref().unwrap_or("unknown"),
                current.as_deref().unwrap_or("unknown"),
                plan.driver.migration_required_at.as_deref().unwrap_or("")
            ),
        );

        let request = MigrationRequest {
            driver_id: plan.driver.driver_id.clone(),
            previous_version: plan.driver.installed_version.clone().unwrap_or_default(),
            current_version: current.unwrap_or_default(),
            remote_url: self.remote.remote_url(),
            api_key: self.remote.api_key().map(str::to_string),
        };

        let coordinator = MigrationCoordinator::new(self.api.clone(), self.pacing.clone());
        match coordinator.migrate(&request).await {
            Ok(outcome) if !outcome.executed => {
                report.warning(
                    Stage::ApplyMigration,
                    "driver offered no device to migrate, entity ids were not migrated",
                );
            }
            Ok(outcome) => {
                state.migration_executed = true;
                let before = state.captured_entities.clone();
                state.captured_entities = apply_mappings(&before, &outcome.mappings);
                report.migrated_entities = before
                    .iter()
                    .zip(&state.captured_entities)
                    .filter(|(old, new)| old != new)
                    .count();
                match outcome.driver_error {
                    Some(error) => report.warning(
                        Stage::ApplyMigration,
                        format!("driver reported {}, applied {} mapping(s)", error, outcome.mappings.len()),
                    ),
                    None => report.completed_with(
                        Stage::ApplyMigration,
                        format!("{} mapping(s), {} entities rewritten", outcome.mappings.len(), report.migrated_entities),
                    ),
                }
            }
            Err(e) => report.warning(Stage::ApplyMigration, format!("migration failed: {}", e)),
        }
    }

    async fn register_entities(&self, state: &RunState, report: &mut PipelineReport) {
        if !self.settings.auto_register_entities {
            report.skipped(Stage::RegisterEntities, "automatic registration disabled");
            return;
        }
        if state.captured_entities.is_empty() {
            report.skipped(Stage::RegisterEntities, "no previously configured entities");
            return;
        }
        let Some(instance_id) = report.restored_instance_id.clone() else {
            report.warning(Stage::RegisterEntities, "no restored instance to register entities on");
            return;
        };

        if state.migration_executed {
            if let Err(e) = self.api.delete_all_entities(&instance_id).await {
                tracing::warn!(instance_id = %instance_id, error = %e, "could not clear entities before re-registering");
            }
        }

        match self
            .api
            .register_entities(&instance_id, Some(&state.captured_entities))
            .await
        {
            Ok(()) => {
                report.registered_entities = state.captured_entities.len();
                report.completed_with(
                    Stage::RegisterEntities,
                    format!("{} entities on {}", state.captured_entities.len(), instance_id),
                );
            }
            Err(e) => report.warning(Stage::RegisterEntities, format!("registration failed: {}", e)),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
