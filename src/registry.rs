//! Integration Registry
//!
//! TigerStyle: Capability flags come from the registry, versions from the remote.
//!
//! The registry is a JSON list of known integrations (by URL or local
//! file). It declares what the remote cannot tell us: whether a driver
//! supports backup, from which version, and at which version entity
//! identifiers changed. [`Driver`] joins a registry entry with the
//! remote's view of an installed driver.

use crate::remote::{localized_text, DriverInfo, DRIVER_TYPE_CUSTOM};
use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Timeout for fetching the registry
pub const REGISTRY_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// Types
// =============================================================================

/// One known integration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryEntry {
    /// Registry identifier
    pub id: String,
    /// Driver identifier on the remote, when it differs from `id`
    pub driver_id: Option<String>,
    /// Display name
    pub name: Value,
    pub description: Option<String>,
    /// Source repository URL (releases are downloaded from here)
    pub repository: Option<String>,
    /// Driver implements the backup/restore setup sub-flows
    pub supports_backup: bool,
    /// First driver version with working backup/restore
    pub backup_min_version: Option<String>,
    /// First driver version with renamed entity identifiers
    pub migration_required_at: Option<String>,
}

impl RegistryEntry {
    pub fn display_name(&self) -> String {
        localized_text(&self.name).unwrap_or_else(|| self.id.clone())
    }

    /// Remote driver id this entry describes.
    pub fn effective_driver_id(&self) -> &str {
        self.driver_id.as_deref().filter(|d| !d.is_empty()).unwrap_or(&self.id)
    }
}

/// Loaded registry with lookup helpers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub fn new(entries: Vec<RegistryEntry>) -> Self {
        Self { entries }
    }

    /// Parse either a bare list or `{"integrations": [...]}`.
    pub fn from_json(value: Value) -> Result<Self, RegistryError> {
        let list = match value {
            Value::Object(mut map) => map.remove("integrations").unwrap_or(Value::Array(vec![])),
            other => other,
        };
        let entries: Vec<RegistryEntry> =
            serde_json::from_value(list).map_err(|e| RegistryError::Invalid(e.to_string()))?;
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Lookup by registry id.
    pub fn by_id(&self, id: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Find the entry for an installed driver: by driver id, then by
    /// registry id, then by a loose name match.
    pub fn find(&self, driver_id: &str, driver_name: &str) -> Option<&RegistryEntry> {
        if let Some(entry) = self
            .entries
            .iter()
            .find(|e| e.driver_id.as_deref() == Some(driver_id))
        {
            return Some(entry);
        }
        if let Some(entry) = self.by_id(driver_id) {
            return Some(entry);
        }

        let wanted = driver_name.trim().to_lowercase();
        if wanted.is_empty() {
            return None;
        }
        self.entries.iter().find(|e| {
            let name = e.display_name().to_lowercase();
            !name.is_empty() && (name == wanted || name.contains(&wanted) || wanted.contains(&name))
        })
    }
}

// =============================================================================
// Versions
// =============================================================================

/// Parse a driver version leniently: `v` prefix, pre-release/build suffix
/// and missing components are tolerated (`"v1.2"` → `1.2.0`).
pub fn parse_version(raw: &str) -> Option<Version> {
    let trimmed = raw.trim().trim_start_matches(['v', 'V']);
    let core = trimmed.split(['-', '+']).next().unwrap_or("");
    if core.is_empty() {
        return None;
    }

    let mut parts: Vec<&str> = core.split('.').collect();
    if parts.len() > 3 || parts.iter().any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
        return None;
    }
    while parts.len() < 3 {
        parts.push("0");
    }
    Version::parse(&parts.join(".")).ok()
}

/// Whether a configuration backup can be taken for a driver version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupEligibility {
    Eligible,
    /// Registry does not declare backup support
    Unsupported,
    /// Installed version predates backup support
    VersionTooOld { minimum: String, installed: String },
}

impl BackupEligibility {
    /// Evaluate registry flags against an installed version. Versions that
    /// cannot be parsed are assumed compatible.
    pub fn check(supports_backup: bool, minimum: Option<&str>, installed: Option<&str>) -> Self {
        if !supports_backup {
            return Self::Unsupported;
        }
        let (Some(minimum), Some(installed)) = (minimum.filter(|m| !m.is_empty()), installed) else {
            return Self::Eligible;
        };
        match (parse_version(installed), parse_version(minimum)) {
            (Some(have), Some(need)) if have < need => Self::VersionTooOld {
                minimum: minimum.to_string(),
                installed: installed.to_string(),
            },
            _ => Self::Eligible,
        }
    }

    pub fn is_eligible(&self) -> bool {
        matches!(self, Self::Eligible)
    }

    /// Human-readable reason for skipping.
    pub fn reason(&self) -> String {
        match self {
            Self::Eligible => String::new(),
            Self::Unsupported => "integration doesn't support backup".to_string(),
            Self::VersionTooOld { minimum, installed } => {
                format!("requires version {} or higher (current: {})", minimum, installed)
            }
        }
    }
}

/// Whether an upgrade from `previous` to `current` crosses the declared
/// migration boundary.
///
/// Runs when the boundary is set and `previous` is below it (and `current`,
/// when known, is at or above it). Unparsable versions count as crossing.
pub fn migration_applies(boundary: Option<&str>, previous: Option<&str>, current: Option<&str>) -> bool {
    let Some(boundary) = boundary.map(str::trim).filter(|b| !b.is_empty()) else {
        return false;
    };
    let Some(boundary) = parse_version(boundary) else {
        return true;
    };
    let Some(previous) = previous.and_then(parse_version) else {
        return true;
    };
    if previous >= boundary {
        return false;
    }
    match current {
        Some(raw) => parse_version(raw).map(|c| c >= boundary).unwrap_or(true),
        None => true,
    }
}

/// Whether `latest` is newer than `current`. Unparsable versions never
/// count as an update.
pub fn update_available(current: &str, latest: &str) -> bool {
    match (parse_version(current), parse_version(latest)) {
        (Some(current), Some(latest)) => latest > current,
        _ => false,
    }
}

// =============================================================================
// Driver
// =============================================================================

/// An installed driver joined with its registry capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Driver {
    pub driver_id: String,
    pub name: String,
    pub installed_version: Option<String>,
    pub driver_type: Option<String>,
    pub supports_backup: bool,
    pub backup_min_version: Option<String>,
    pub migration_required_at: Option<String>,
    /// Repository releases are downloaded from
    pub repository: Option<String>,
}

impl Driver {
    /// Join remote driver info with its registry entry (if any). The
    /// driver's own home page wins when it points at GitHub.
    pub fn resolve(info: &DriverInfo, entry: Option<&RegistryEntry>) -> Self {
        let home_page = info
            .home_page
            .clone()
            .filter(|h| h.contains("github.com"));
        Self {
            driver_id: info.driver_id.clone(),
            name: info.display_name(),
            installed_version: info.version.clone(),
            driver_type: info.driver_type.clone(),
            supports_backup: entry.map(|e| e.supports_backup).unwrap_or(false),
            backup_min_version: entry.and_then(|e| e.backup_min_version.clone()),
            migration_required_at: entry.and_then(|e| e.migration_required_at.clone()),
            repository: home_page.or_else(|| entry.and_then(|e| e.repository.clone())),
        }
    }

    pub fn is_custom(&self) -> bool {
        self.driver_type.as_deref() == Some(DRIVER_TYPE_CUSTOM)
    }

    pub fn backup_eligibility(&self) -> BackupEligibility {
        BackupEligibility::check(
            self.supports_backup,
            self.backup_min_version.as_deref(),
            self.installed_version.as_deref(),
        )
    }

    /// A failed backup must abort an update of this driver.
    pub fn backup_mandatory(&self) -> bool {
        self.backup_eligibility().is_eligible()
    }

    /// Whether upgrading to `current` may require entity migration.
    pub fn migration_applies(&self, current: Option<&str>) -> bool {
        migration_applies(
            self.migration_required_at.as_deref(),
            self.installed_version.as_deref(),
            current,
        )
    }
}

// =============================================================================
// Sources
// =============================================================================

/// Where the registry comes from.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn load(&self) -> Result<Registry, RegistryError>;
}

/// Registry at a URL or a local file path.
pub struct HttpRegistry {
    location: String,
    http: reqwest::Client,
}

impl HttpRegistry {
    pub fn new(location: impl Into<String>) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REGISTRY_TIMEOUT_SECS))
            .build()
            .map_err(|e| RegistryError::Fetch(e.to_string()))?;
        Ok(Self {
            location: location.into(),
            http,
        })
    }
}

#[async_trait]
impl RegistrySource for HttpRegistry {
    async fn load(&self) -> Result<Registry, RegistryError> {
        if Path::new(&self.location).exists() {
            tracing::debug!(path = %self.location, "loading registry from file");
            let bytes = tokio::fs::read(&self.location)
                .await
                .map_err(|e| RegistryError::Fetch(e.to_string()))?;
            let value: Value =
                serde_json::from_slice(&bytes).map_err(|e| RegistryError::Invalid(e.to_string()))?;
            return Registry::from_json(value);
        }

        tracing::debug!(url = %self.location, "loading registry from URL");
        let response = self
            .http
            .get(&self.location)
            .send()
            .await
            .map_err(|e| RegistryError::Fetch(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RegistryError::Fetch(format!("registry returned {}", response.status())));
        }
        let value: Value = response
            .json()
            .await
            .map_err(|e| RegistryError::Invalid(e.to_string()))?;
        Registry::from_json(value)
    }
}

/// A fixed, in-memory registry.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry(pub Registry);

#[async_trait]
impl RegistrySource for StaticRegistry {
    async fn load(&self) -> Result<Registry, RegistryError> {
        Ok(self.0.clone())
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Registry errors
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("failed to fetch registry: {0}")]
    Fetch(String),

    #[error("invalid registry: {0}")]
    Invalid(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_update_available() {
        assert!(update_available("1.5.0", "v2.1.0"));
        assert!(update_available("v1.2", "1.2.1-beta"));
        assert!(!update_available("2.1.0", "v2.1.0"));
        assert!(!update_available("2.2.0", "2.1.0"));
        assert!(!update_available("", "2.1.0"));
        assert!(!update_available("1.0.0", "nightly"));
    }

    #[test]
    fn test_parse_version_lenient() {
        assert_eq!(parse_version("1.2.3"), Some(Version::new(1, 2, 3)));
        assert_eq!(parse_version("v2.0"), Some(Version::new(2, 0, 0)));
        assert_eq!(parse_version("3"), Some(Version::new(3, 0, 0)));
        assert_eq!(parse_version("1.4.0-beta.1"), Some(Version::new(1, 4, 0)));
        assert_eq!(parse_version("garbage"), None);
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("1.2.3.4"), None);
    }

    #[test]
    fn test_backup_eligibility() {
        assert!(BackupEligibility::check(true, Some("1.0.0"), Some("1.2.0")).is_eligible());
        assert!(BackupEligibility::check(true, None, Some("0.1.0")).is_eligible());
        assert_eq!(
            BackupEligibility::check(false, None, Some("1.0.0")),
            BackupEligibility::Unsupported
        );
        assert!(matches!(
            BackupEligibility::check(true, Some("1.0.0"), Some("0.9.0")),
            BackupEligibility::VersionTooOld { .. }
        ));
        // unparsable versions are assumed compatible
        assert!(BackupEligibility::check(true, Some("1.0.0"), Some("dev-build")).is_eligible());
    }

    #[test]
    fn test_migration_applies() {
        assert!(migration_applies(Some("2.0.0"), Some("1.5.0"), Some("2.1.0")));
        assert!(!migration_applies(Some("2.0.0"), Some("2.0.1"), Some("2.1.0")));
        assert!(!migration_applies(Some("2.0.0"), Some("1.5.0"), Some("1.9.0")));
        assert!(migration_applies(Some("2.0.0"), Some("1.5.0"), None));
        assert!(!migration_applies(None, Some("1.5.0"), Some("2.1.0")));
        assert!(!migration_applies(Some(""), Some("1.5.0"), Some("2.1.0")));
        assert!(migration_applies(Some("2.0.0"), Some("unknown"), Some("2.1.0")));
    }

    #[test]
    fn test_registry_from_json_shapes() {
        let list = Registry::from_json(json!([{"id": "psn", "supports_backup": true}])).unwrap();
        assert_eq!(list.entries().len(), 1);
        assert!(list.by_id("psn").unwrap().supports_backup);

        let wrapped = Registry::from_json(json!({"integrations": [{"id": "a"}, {"id": "b"}]})).unwrap();
        assert_eq!(wrapped.entries().len(), 2);

        let empty = Registry::from_json(json!({"other": 1})).unwrap();
        assert!(empty.entries().is_empty());
    }

    #[test]
    fn test_registry_find_order() {
        let registry = Registry::from_json(json!([
            {"id": "uc-intg-psn", "driver_id": "psn_driver", "name": "PlayStation"},
            {"id": "denon", "name": "Denon AVR"},
            {"id": "lg", "name": {"en": "LG TV"}}
        ]))
        .unwrap();

        assert_eq!(registry.find("psn_driver", "").unwrap().id, "uc-intg-psn");
        assert_eq!(registry.find("denon", "whatever").unwrap().id, "denon");
        assert_eq!(registry.find("lgtv_driver", "LG TV").unwrap().id, "lg");
        assert!(registry.find("unknown", "").is_none());
    }

    #[test]
    fn test_driver_resolve() {
        let info = DriverInfo {
            driver_id: "psn".to_string(),
            name: json!({"en": "PlayStation"}),
            version: Some("1.5.0".to_string()),
            driver_type: Some("CUSTOM".to_string()),
            home_page: Some("https://example.com".to_string()),
        };
        let entry = RegistryEntry {
            id: "psn".to_string(),
            repository: Some("https://github.com/owner/uc-intg-psn".to_string()),
            supports_backup: true,
            backup_min_version: Some("1.0.0".to_string()),
            migration_required_at: Some("2.0.0".to_string()),
            ..Default::default()
        };

        let driver = Driver::resolve(&info, Some(&entry));
        assert_eq!(driver.name, "PlayStation");
        assert!(driver.is_custom());
        assert!(driver.backup_mandatory());
        assert!(driver.migration_applies(Some("2.1.0")));
        assert_eq!(driver.repository.as_deref(), Some("https://github.com/owner/uc-intg-psn"));

        let bare = Driver::resolve(&info, None);
        assert!(!bare.supports_backup);
        assert!(!bare.backup_mandatory());
        assert!(!bare.migration_applies(Some("2.1.0")));
    }

    #[tokio::test]
    async fn test_http_registry_reads_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(&path, r#"{"integrations": [{"id": "psn"}]}"#).unwrap();

        let registry = HttpRegistry::new(path.to_string_lossy().to_string())
            .unwrap()
            .load()
            .await
            .unwrap();
        assert!(registry.by_id("psn").is_some());
    }
}
