//! Configuration
//!
//! TigerStyle: Explicit, named configuration for every tunable.
//!
//! Sources, lowest to highest precedence:
//! 1. Built-in defaults (constants below)
//! 2. `.env` file (loaded by the binary via dotenvy)
//! 3. Environment variables
//! 4. CLI flags (applied by the binary)
//!
//! The setup-flow protocol exposes no readiness signal, so every remote
//! state transition is followed by a named delay from [`PacingConfig`].

use crate::notify::NotificationSettings;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Default HTTP port of the remote's REST API
pub const REMOTE_PORT_DEFAULT: u16 = 80;

/// Basic-auth user name used together with the web configurator PIN
pub const REMOTE_PIN_USER: &str = "web-configurator";

/// Default data directory (backups, settings)
pub const DATA_DIR_DEFAULT: &str = "~/.intg-manager";

/// Default HTTP port of the management API
pub const HTTP_PORT_DEFAULT: u16 = 8088;

/// Default integration registry location
pub const REGISTRY_URL_DEFAULT: &str =
    "https://raw.githubusercontent.com/JackJPowell/uc-intg-list/refs/heads/main/registry.json";

/// Base delay between setup-flow requests in milliseconds
pub const API_DELAY_MS_DEFAULT: u64 = 750;

/// Maximum reads while waiting for a setup session to settle
pub const SESSION_POLL_ATTEMPTS_DEFAULT: u32 = 10;

/// Maximum driver-list polls while waiting for a freshly installed driver
pub const DRIVER_READY_POLL_ATTEMPTS_DEFAULT: u32 = 10;

/// Interval between driver-list polls in milliseconds
pub const DRIVER_READY_POLL_INTERVAL_MS_DEFAULT: u64 = 500;

/// Default time of day for the scheduled backup (HH:MM)
pub const BACKUP_TIME_DEFAULT: &str = "02:00";

/// Environment variable names
pub const ENV_REMOTE_ADDRESS: &str = "UC_REMOTE_ADDRESS";
pub const ENV_REMOTE_PORT: &str = "UC_REMOTE_PORT";
pub const ENV_REMOTE_PIN: &str = "UC_REMOTE_PIN";
pub const ENV_REMOTE_API_KEY: &str = "UC_REMOTE_API_KEY";
pub const ENV_DATA_DIR: &str = "UC_CONFIG_HOME";
pub const ENV_REGISTRY_URL: &str = "UC_REGISTRY_URL";
pub const ENV_HTTP_PORT: &str = "UC_INTG_MANAGER_HTTP_PORT";
pub const ENV_API_DELAY_MS: &str = "UC_API_DELAY_MS";

// =============================================================================
// Remote Connection
// =============================================================================

/// Connection details for the remote hub.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct RemoteConfig {
    /// IP address or hostname of the remote
    pub address: String,
    /// HTTP port of the REST API
    pub port: u16,
    /// Web configurator PIN (Basic auth)
    pub pin: Option<String>,
    /// API key (Bearer auth, preferred over PIN)
    pub api_key: Option<String>,
}

impl RemoteConfig {
    /// Create a config for the given address on the default port.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: REMOTE_PORT_DEFAULT,
            pin: None,
            api_key: None,
        }
    }

    /// Base URL of the REST API (`http://host:port/api`).
    pub fn base_url(&self) -> String {
        format!("http://{}:{}/api", self.address, self.port)
    }

    /// URL of the remote itself, as handed to drivers during migration.
    pub fn remote_url(&self) -> String {
        if self.port == REMOTE_PORT_DEFAULT {
            format!("http://{}", self.address)
        } else {
            format!("http://{}:{}", self.address, self.port)
        }
    }

    /// The API key, if one is configured and non-empty.
    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref().filter(|k| !k.is_empty())
    }

    /// The PIN, if one is configured and non-empty.
    pub fn pin(&self) -> Option<&str> {
        self.pin.as_deref().filter(|p| !p.is_empty())
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("pin", &self.pin.as_ref().map(|_| "****"))
            .field("api_key", &self.api_key.as_ref().map(|_| "****"))
            .finish()
    }
}

// =============================================================================
// Pacing
// =============================================================================

/// Named delays for each protocol step, plus bounded polling limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacingConfig {
    /// Pause between ordinary setup-flow requests
    pub step_delay: Duration,
    /// Pause after requesting a backup, before reading the backup page
    pub backup_read_delay: Duration,
    /// Pause after entering restore mode
    pub restore_init_delay: Duration,
    /// Pause after submitting restore data (driver re-initializes)
    pub restore_apply_delay: Duration,
    /// Pause after submitting the migration execution step
    pub migration_execute_delay: Duration,
    /// Pause after uploading a new driver package
    pub install_settle_delay: Duration,
    /// Pause after the driver shows up in the driver list
    pub driver_ready_settle_delay: Duration,
    /// Pause between two drivers during backup-all
    pub between_drivers_delay: Duration,
    /// Interval between reads while polling a setup session
    pub session_poll_interval: Duration,
    /// Maximum reads while polling a setup session
    pub session_poll_attempts: u32,
    /// Interval between driver-list polls after install
    pub driver_ready_poll_interval: Duration,
    /// Maximum driver-list polls after install
    pub driver_ready_poll_attempts: u32,
}

impl PacingConfig {
    /// Derive all step delays from a single base delay.
    pub fn from_base_delay(base: Duration) -> Self {
        Self {
            step_delay: base,
            backup_read_delay: base * 2,
            restore_init_delay: base * 2,
            restore_apply_delay: base * 2,
            migration_execute_delay: base * 4,
            install_settle_delay: base * 2,
            driver_ready_settle_delay: base * 3,
            between_drivers_delay: base * 2,
            session_poll_interval: base,
            session_poll_attempts: SESSION_POLL_ATTEMPTS_DEFAULT,
            driver_ready_poll_interval: Duration::from_millis(DRIVER_READY_POLL_INTERVAL_MS_DEFAULT),
            driver_ready_poll_attempts: DRIVER_READY_POLL_ATTEMPTS_DEFAULT,
        }
    }

    /// No delays at all; polling limits are kept. Used by tests and the simulator.
    pub fn immediate() -> Self {
        Self {
            driver_ready_poll_interval: Duration::ZERO,
            ..Self::from_base_delay(Duration::ZERO)
        }
    }

    /// Sleep for the given step delay (no-op for zero).
    pub async fn pause(&self, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self::from_base_delay(Duration::from_millis(API_DELAY_MS_DEFAULT))
    }
}

// =============================================================================
// User Settings
// =============================================================================

/// User-facing behavior switches, persisted next to the backups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Re-register previously configured entities after an update
    pub auto_register_entities: bool,
    /// Run the daily scheduled backup
    pub backup_configs: bool,
    /// Time of day for the scheduled backup (HH:MM)
    pub backup_time: String,
    pub notifications: NotificationSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_register_entities: true,
            backup_configs: false,
            backup_time: BACKUP_TIME_DEFAULT.to_string(),
            notifications: NotificationSettings::default(),
        }
    }
}

// =============================================================================
// Application Config
// =============================================================================

/// Everything the binary needs to wire up an orchestrator.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Remote connection
    pub remote: RemoteConfig,
    /// Data directory (expanded)
    pub data_dir: PathBuf,
    /// Integration registry URL
    pub registry_url: String,
    /// Management API bind address
    pub http_bind: String,
    /// Protocol pacing
    pub pacing: PacingConfig,
}

impl AppConfig {
    /// Build the config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let remote = RemoteConfig {
            address: env_string(ENV_REMOTE_ADDRESS).unwrap_or_default(),
            port: env_parse(ENV_REMOTE_PORT)?.unwrap_or(REMOTE_PORT_DEFAULT),
            pin: env_string(ENV_REMOTE_PIN),
            api_key: env_string(ENV_REMOTE_API_KEY),
        };

        let data_dir = env_string(ENV_DATA_DIR).unwrap_or_else(|| DATA_DIR_DEFAULT.to_string());
        let http_port: u16 = env_parse(ENV_HTTP_PORT)?.unwrap_or(HTTP_PORT_DEFAULT);
        let delay_ms: u64 = env_parse(ENV_API_DELAY_MS)?.unwrap_or(API_DELAY_MS_DEFAULT);

        Ok(Self {
            remote,
            data_dir: expand_path(&data_dir),
            registry_url: env_string(ENV_REGISTRY_URL)
                .unwrap_or_else(|| REGISTRY_URL_DEFAULT.to_string()),
            http_bind: format!("0.0.0.0:{}", http_port),
            pacing: PacingConfig::from_base_delay(Duration::from_millis(delay_ms)),
        })
    }

    /// Check that the config can reach a remote.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.remote.address.trim().is_empty() {
            return Err(ConfigError::Missing(ENV_REMOTE_ADDRESS));
        }
        if self.remote.api_key().is_none() && self.remote.pin().is_none() {
            return Err(ConfigError::Missing(ENV_REMOTE_API_KEY));
        }
        Ok(())
    }
}

/// Expand `~` and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).to_string())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        None => Ok(None),
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing configuration: {0}")]
    Missing(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

// =============================================================================
// Tests
// =============================================================================
