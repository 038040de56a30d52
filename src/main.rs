//! Integration Manager CLI
//!
//! Runs the management HTTP API with the scheduled backup loop, or a single
//! lifecycle operation against the configured remote.

use clap::{Parser, Subcommand};
use intg_manager::api;
use intg_manager::config::{expand_path, AppConfig};
use intg_manager::manager::{Orchestrator, ScheduledBackup};
use intg_manager::pipeline::PipelineReport;
use intg_manager::registry::HttpRegistry;
use intg_manager::release::GitHubReleases;
use intg_manager::store::BackupStore;
use intg_manager::{RemoteClient, APP_NAME, APP_VERSION};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Interval between scheduled backup checks
const SCHEDULE_TICK_SECS: u64 = 60;

// =============================================================================
// CLI
// =============================================================================

/// Integration Manager - lifecycle orchestration for hub integration drivers
#[derive(Parser, Debug)]
#[command(name = APP_NAME)]
#[command(about = "Back up, update, restore and migrate hub integration drivers")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Data directory for backups and settings (overrides UC_CONFIG_HOME)
    #[arg(long, global = true)]
    data_dir: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and scheduled backups (default)
    Serve {
        /// HTTP bind address
        #[arg(short, long)]
        bind: Option<String>,
    },
    /// Update the driver of a configured integration
    Update {
        instance_id: String,
        /// Release tag (latest when omitted)
        #[arg(long)]
        tag: Option<String>,
    },
    /// Update an installed driver
    UpdateDriver {
        driver_id: String,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Install a driver from the registry
    Install {
        registry_id: String,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Delete a driver and its instances
    Delete { driver_id: String },
    /// Back up one driver's configuration
    Backup { driver_id: String },
    /// Back up every driver that supports it
    BackupAll,
    /// Print a stored backup
    ShowBackup { driver_id: String },
    /// Remove a stored backup
    DeleteBackup { driver_id: String },
    /// Write every stored backup and the settings as one JSON document
    ExportBackups {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<String>,
    },
    /// Replace the stored backups with an exported document
    ImportBackups { path: String },
    /// Compare installed custom drivers with their latest releases
    CheckVersions,
    /// Print the settings, or replace them from a JSON file
    Settings {
        #[arg(long)]
        set: Option<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .init();

    tracing::info!("Integration Manager v{}", APP_VERSION);

    let mut config = AppConfig::from_env()?;
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = expand_path(data_dir);
    }
    config.validate()?;

    tokio::fs::create_dir_all(&config.data_dir).await?;
    tracing::info!("Data directory: {}", config.data_dir.display());
    tracing::info!(remote = ?config.remote, "Remote configured");

    let orchestrator = Arc::new(build_orchestrator(&config).await?);

    match cli.command.unwrap_or(Command::Serve { bind: None }) {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.http_bind.clone());
            serve(orchestrator, &bind).await?;
        }
        Command::Update { instance_id, tag } => {
            finish(orchestrator.update_integration(&instance_id, tag).await?)?;
        }
        Command::UpdateDriver { driver_id, tag } => {
            finish(orchestrator.update_driver(&driver_id, tag).await?)?;
        }
        Command::Install { registry_id, tag } => {
            finish(orchestrator.install(&registry_id, tag).await?)?;
        }
        Command::Delete { driver_id } => {
            orchestrator.delete_driver(&driver_id).await?;
            println!("Deleted {}", driver_id);
        }
        Command::Backup { driver_id } => match orchestrator.backup_driver(&driver_id).await? {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => anyhow::bail!("{} does not offer a configuration backup", driver_id),
        },
        Command::BackupAll => {
            let summary = orchestrator.backup_all().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.is_success() {
                anyhow::bail!("no backups succeeded");
            }
        }
        Command::ShowBackup { driver_id } => match orchestrator.get_backup(&driver_id).await? {
            Some(record) => println!("{}", record.data),
            None => anyhow::bail!("no backup stored for {}", driver_id),
        },
        Command::DeleteBackup { driver_id } => {
            if !orchestrator.delete_backup(&driver_id).await? {
                anyhow::bail!("no backup stored for {}", driver_id);
            }
            println!("Deleted backup of {}", driver_id);
        }
        Command::ExportBackups { output } => {
            let document = serde_json::to_string_pretty(&orchestrator.export_backups().await?)?;
            match output {
                Some(path) => {
                    tokio::fs::write(expand_path(&path), document).await?;
                    tracing::info!("Exported backups to {}", path);
                }
                None => println!("{}", document),
            }
        }
        Command::ImportBackups { path } => {
            let text = tokio::fs::read_to_string(expand_path(&path)).await?;
            let summary = orchestrator.import_backups(serde_json::from_str(&text)?).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::CheckVersions => {
            let report = orchestrator.check_versions().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Settings { set } => {
            if let Some(path) = set {
                let text = tokio::fs::read_to_string(expand_path(&path)).await?;
                orchestrator.save_settings(&serde_json::from_str(&text)?).await?;
            }
            println!("{}", serde_json::to_string_pretty(&orchestrator.settings().await)?);
        }
    }

    Ok(())
}

async fn build_orchestrator(config: &AppConfig) -> anyhow::Result<Orchestrator> {
    let api = RemoteClient::new(config.remote.clone())?;
    let releases = GitHubReleases::new()?;
    let registry = HttpRegistry::new(config.registry_url.clone())?;
    let store = BackupStore::open(&config.data_dir).await?;

    Ok(Orchestrator::new(
        Arc::new(api),
        Arc::new(releases),
        Arc::new(registry),
        Arc::new(store),
        config.pacing.clone(),
        config.remote.clone(),
    ))
}

/// Print a pipeline report; a failed run exits non-zero.
fn finish(report: PipelineReport) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_success() {
        anyhow::bail!("{}", report.reason);
    }
    Ok(())
}

async fn serve(orchestrator: Arc<Orchestrator>, bind: &str) -> anyhow::Result<()> {
    let scheduler = orchestrator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SCHEDULE_TICK_SECS));
        loop {
            interval.tick().await;
            let now = chrono::Local::now().naive_local();
            match scheduler.scheduled_backup(now).await {
                ScheduledBackup::Completed { success: false, .. } => {
                    tracing::warn!("scheduled backup will retry while the window is open")
                }
                outcome => tracing::trace!(?outcome, "schedule tick"),
            }
        }
    });

    tracing::info!("Starting HTTP server on {}", bind);
    let addr: std::net::SocketAddr = bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, api::router(orchestrator)).await?;
    Ok(())
}
