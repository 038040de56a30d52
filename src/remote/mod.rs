//! Remote Device API
//!
//! TigerStyle: One trait at the vendor boundary, everything above is pure logic.
//!
//! The remote hub exposes drivers, integration instances, entities and the
//! interactive setup flow over a REST API. [`DeviceApi`] is the seam the
//! orchestrator talks to; [`RemoteClient`] is the HTTP implementation and
//! [`crate::sim::SimDevice`] the in-memory one used by tests.

mod client;

pub use client::RemoteClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Driver type of user-installed drivers (the only ones we manage)
pub const DRIVER_TYPE_CUSTOM: &str = "CUSTOM";

/// Page size for driver and instance listings
pub const LIST_LIMIT_DEFAULT: u32 = 100;

/// Page size for entity listings
pub const ENTITY_LIST_LIMIT_DEFAULT: u32 = 100;

// =============================================================================
// Types
// =============================================================================

/// Answers submitted in one setup-flow step, keyed by field id.
pub type SetupInputs = BTreeMap<String, String>;

/// An installed driver as reported by the remote.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverInfo {
    /// Driver identifier
    pub driver_id: String,
    /// Display name (plain string or localized object)
    pub name: Value,
    /// Installed version
    pub version: Option<String>,
    /// "CUSTOM" for user-installed drivers
    pub driver_type: Option<String>,
    /// Project home page, if the driver declares one
    pub home_page: Option<String>,
}

impl DriverInfo {
    /// Whether this driver was installed by the user (and can be managed).
    pub fn is_custom(&self) -> bool {
        self.driver_type.as_deref() == Some(DRIVER_TYPE_CUSTOM)
    }

    /// Display name, resolved from a localized value.
    pub fn display_name(&self) -> String {
        localized_text(&self.name).unwrap_or_else(|| self.driver_id.clone())
    }
}

/// A configured integration instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceInfo {
    /// Instance identifier
    pub integration_id: String,
    /// Owning driver
    pub driver_id: String,
    /// Display name (plain string or localized object)
    pub name: Value,
    /// Whether the instance is enabled
    pub enabled: bool,
    /// Connection state reported by the driver
    pub device_state: Option<String>,
    /// Entity identifiers the user registered
    pub configured_entities: Vec<String>,
    /// Driver version running this instance
    pub version: Option<String>,
}

impl Default for InstanceInfo {
    fn default() -> Self {
        Self {
            integration_id: String::new(),
            driver_id: String::new(),
            name: Value::Null,
            enabled: true,
            device_state: None,
            configured_entities: Vec::new(),
            version: None,
        }
    }
}

/// An entity exposed by an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityInfo {
    pub entity_id: String,
    pub entity_type: Option<String>,
    pub name: Value,
}

/// Which entities of an instance to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityFilter {
    /// Every entity the driver exposes
    All,
    /// Only entities not yet registered
    New,
    /// Only registered entities
    Configured,
}

impl EntityFilter {
    /// Query value understood by the remote (`None` for no filter).
    pub fn as_query(self) -> Option<&'static str> {
        match self {
            Self::All => None,
            Self::New => Some("NEW"),
            Self::Configured => Some("CONFIGURED"),
        }
    }
}

/// Resolve a display text that may be a plain string or a localized object.
///
/// Localized objects prefer the `en` entry, then the first string value.
pub fn localized_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("en")
            .and_then(Value::as_str)
            .or_else(|| map.values().find_map(Value::as_str))
            .map(str::to_string),
        _ => None,
    }
}

// =============================================================================
// Device API
// =============================================================================

/// Operations the orchestrator needs from the remote.
///
/// Setup-flow calls return the raw response body; interpretation lives in
/// [`crate::setup`]. No call is retried here.
#[async_trait]
pub trait DeviceApi: Send + Sync {
    /// Begin a setup session (`POST /intg/setup`).
    async fn start_setup(&self, driver_id: &str, reconfigure: bool) -> Result<Value, RemoteError>;

    /// Read the current setup page (`GET /intg/setup/{id}`).
    async fn get_setup(&self, driver_id: &str) -> Result<Value, RemoteError>;

    /// Submit one step of the setup flow (`PUT /intg/setup/{id}`).
    async fn send_setup_input(
        &self,
        driver_id: &str,
        inputs: &SetupInputs,
    ) -> Result<Value, RemoteError>;

    /// Terminate the setup session (`DELETE /intg/setup/{id}`).
    async fn delete_setup(&self, driver_id: &str) -> Result<(), RemoteError>;

    /// Fetch one driver; `None` when the remote does not know it.
    async fn get_driver(&self, driver_id: &str) -> Result<Option<DriverInfo>, RemoteError>;

    /// List installed drivers.
    async fn list_drivers(&self) -> Result<Vec<DriverInfo>, RemoteError>;

    /// List all integration instances.
    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, RemoteError>;

    /// List enabled integration instances.
    async fn list_enabled_instances(&self) -> Result<Vec<InstanceInfo>, RemoteError>;

    /// Fetch one integration instance.
    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo, RemoteError>;

    /// List entities exposed by an instance.
    async fn list_instance_entities(
        &self,
        instance_id: &str,
        filter: EntityFilter,
    ) -> Result<Vec<EntityInfo>, RemoteError>;

    /// Register entities on an instance; `None` registers every available entity.
    async fn register_entities(
        &self,
        instance_id: &str,
        entity_ids: Option<&[String]>,
    ) -> Result<(), RemoteError>;

    /// Remove every registered entity of an instance.
    async fn delete_all_entities(&self, instance_id: &str) -> Result<(), RemoteError>;

    /// Remove a driver (and its instances).
    async fn delete_driver(&self, driver_id: &str) -> Result<(), RemoteError>;

    /// Upload a driver package.
    async fn install_driver(&self, package: Vec<u8>, filename: &str) -> Result<Value, RemoteError>;
}

// =============================================================================
// Errors
// =============================================================================

/// Remote API errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// Connection refused, reset, or timed out
    #[error("transport error: {0}")]
    Transport(String),

    /// Credentials rejected (401/403)
    #[error("authentication error: {0}")]
    Auth(String),

    /// Any other non-success status
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Response body could not be decoded
    #[error("decode error: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Connection-level failure; the remote may be unreachable.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// The addressed resource does not exist (or no longer exists).
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }
}

// =============================================================================
// Tests
// =============================================================================
