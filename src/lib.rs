//! Integration Manager - Driver Lifecycle Orchestration
//!
//! Manages the lifecycle of integration drivers installed on a remote hub
//! device. The device only exposes a vendor HTTP API that models
//! configuration as an interactive, multi-step setup flow; this crate drives
//! that flow to back up, restore and migrate driver configuration around
//! driver upgrades.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  manager::Orchestrator      (entry points, OperationLock)    │
//! ├─────────────────────────────────────────────────────────────┤
//! │  pipeline::UpdatePipeline   (ordered stages, report)         │
//! ├───────────────────┬───────────────────┬─────────────────────┤
//! │ BackupCoordinator │ RestoreCoordinator│ MigrationCoordinator│
//! ├───────────────────┴───────────────────┴─────────────────────┤
//! │  setup::SetupSession        (begin / read / advance / end)   │
//! │  setup::fields              (typed field extraction)         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  remote::DeviceApi          (vendor HTTP API boundary)       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Control flows strictly downward. Every lifecycle operation runs while
//! holding the single process-wide [`lock::OperationLock`].

pub mod api;
pub mod backup;
pub mod config;
pub mod lock;
pub mod manager;
pub mod migration;
pub mod notify;
pub mod pipeline;
pub mod registry;
pub mod release;
pub mod remote;
pub mod restore;
pub mod schedule;
pub mod setup;
pub mod sim;
pub mod store;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Application name
pub const APP_NAME: &str = "intg-manager";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

// Re-export common types
pub use backup::{BackupCoordinator, BackupRecord};
pub use config::{AppConfig, PacingConfig, RemoteConfig, Settings};
pub use lock::{LockHolder, OperationGuard, OperationKind, OperationLock};
pub use manager::{Orchestrator, OperationError};
pub use migration::{apply_mappings, MigrationCoordinator, MigrationMapping};
pub use pipeline::{PipelineReport, PipelineStatus, Stage, UpdatePipeline};
pub use remote::{DeviceApi, RemoteClient, RemoteError};
pub use restore::{RestoreCoordinator, RestoreOutcome};
pub use setup::{FlowError, SessionSnapshot, SetupSession, SetupSessionState};
pub use store::BackupStore;
