//! Release Artifacts
//!
//! TigerStyle: Driver packages come from a source repository's releases.
//!
//! [`ReleaseSource`] is the seam: given a repository URL, return the bytes
//! of the first release asset whose name contains a pattern, optionally
//! pinned to a tag. The same seam answers "what is the latest tag" for
//! update checks. [`GitHubReleases`] implements it against the GitHub
//! REST API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// GitHub REST API base URL
pub const GITHUB_API_BASE_DEFAULT: &str = "https://api.github.com";

/// Default asset name pattern (driver packages are gzipped tarballs)
pub const ASSET_PATTERN_DEFAULT: &str = ".tar.gz";

/// Timeout for release metadata requests
pub const METADATA_TIMEOUT_SECS: u64 = 30;

/// Timeout for asset downloads
pub const DOWNLOAD_TIMEOUT_SECS: u64 = 300;

const USER_AGENT: &str = "uc-intg-manager";

// =============================================================================
// Types
// =============================================================================

/// A downloaded release asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseArtifact {
    /// Asset file name
    pub filename: String,
    /// Raw package bytes
    pub bytes: Vec<u8>,
    /// Tag of the release the asset came from
    pub tag_name: String,
}

impl ReleaseArtifact {
    /// Release tag without a leading `v`, usable as a version string.
    pub fn version(&self) -> &str {
        self.tag_name.trim_start_matches(['v', 'V'])
    }
}

/// Where driver packages are downloaded from.
#[async_trait]
pub trait ReleaseSource: Send + Sync {
    /// Fetch the first asset matching `pattern` from the latest release,
    /// or from the release tagged `tag`.
    async fn fetch_asset(
        &self,
        repository_url: &str,
        pattern: &str,
        tag: Option<&str>,
    ) -> Result<ReleaseArtifact, ReleaseError>;

    /// Tag of the latest release, without downloading anything.
    async fn latest_tag(&self, repository_url: &str) -> Result<String, ReleaseError>;
}

/// Split a GitHub URL into `(owner, repo)`.
///
/// Accepts `https://github.com/owner/repo`, with or without `.git`, a
/// trailing slash, or extra path segments.
pub fn parse_github_url(url: &str) -> Option<(String, String)> {
    let (_, rest) = url.split_once("github.com/")?;
    let mut parts = rest.split('/').filter(|p| !p.is_empty());
    let owner = parts.next()?;
    let repo = parts.next()?;
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

// =============================================================================
// GitHub
// =============================================================================

/// GitHub release downloads.
#[derive(Clone)]
pub struct GitHubReleases {
    http: reqwest::Client,
    api_base: String,
}

impl GitHubReleases {
    pub fn new() -> Result<Self, ReleaseError> {
        Self::with_api_base(GITHUB_API_BASE_DEFAULT)
    }

    /// Use a different API base (GitHub Enterprise, test servers).
    pub fn with_api_base(api_base: impl Into<String>) -> Result<Self, ReleaseError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(METADATA_TIMEOUT_SECS))
            .build()
            .map_err(|e| ReleaseError::Http(e.to_string()))?;
        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_release(&self, owner: &str, repo: &str, tag: Option<&str>) -> Result<Release, ReleaseError> {
        let url = match tag {
            Some(tag) => format!("{}/repos/{}/{}/releases/tags/{}", self.api_base, owner, repo, tag),
            None => format!("{}/repos/{}/{}/releases/latest", self.api_base, owner, repo),
        };

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github.v3+json")
            .timeout(Duration::from_secs(METADATA_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| ReleaseError::Http(e.to_string()))?;

        let status = response.status();
        let remaining = response
            .headers()
            .get("X-RateLimit-Remaining")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if status == StatusCode::FORBIDDEN && remaining.as_deref() == Some("0") {
            tracing::warn!(owner = %owner, repo = %repo, "GitHub API rate limit exceeded");
            return Err(ReleaseError::RateLimited);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ReleaseError::NotFound(format!(
                "no release for {}/{}{}",
                owner,
                repo,
                tag.map(|t| format!(" tag {}", t)).unwrap_or_default()
            )));
        }
        if !status.is_success() {
            return Err(ReleaseError::Http(format!("GitHub returned {}", status)));
        }

        response
            .json()
            .await
            .map_err(|e| ReleaseError::Http(format!("invalid release metadata: {}", e)))
    }
}

#[async_trait]
impl ReleaseSource for GitHubReleases {
    async fn fetch_asset(
        &self,
        repository_url: &str,
        pattern: &str,
        tag: Option<&str>,
    ) -> Result<ReleaseArtifact, ReleaseError> {
        let (owner, repo) = parse_github_url(repository_url)
            .ok_or_else(|| ReleaseError::InvalidUrl(repository_url.to_string()))?;

        let release = self.get_release(&owner, &repo, tag).await?;
        let asset = release
            .assets
            .iter()
            .find(|a| a.name.contains(pattern))
            .ok_or_else(|| {
                ReleaseError::NotFound(format!(
                    "no {} asset in release {} of {}/{}",
                    pattern, release.tag_name, owner, repo
                ))
            })?;

        tracing::info!(asset = %asset.name, owner = %owner, repo = %repo, tag = %release.tag_name, "downloading release asset");

        let response = self
            .http
            .get(&asset.browser_download_url)
            .header("Accept", "application/octet-stream")
            .timeout(Duration::from_secs(DOWNLOAD_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| ReleaseError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ReleaseError::Http(format!(
                "asset download returned {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ReleaseError::Http(e.to_string()))?;

        Ok(ReleaseArtifact {
            filename: asset.name.clone(),
            bytes: bytes.to_vec(),
            tag_name: release.tag_name,
        })
    }

    async fn latest_tag(&self, repository_url: &str) -> Result<String, ReleaseError> {
        let (owner, repo) = parse_github_url(repository_url)
            .ok_or_else(|| ReleaseError::InvalidUrl(repository_url.to_string()))?;
        let release = self.get_release(&owner, &repo, None).await?;
        Ok(release.tag_name)
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Release acquisition errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReleaseError {
    #[error("could not parse repository URL: {0}")]
    InvalidUrl(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("GitHub API rate limit exceeded")]
    RateLimited,

    #[error("HTTP error: {0}")]
    Http(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_github_url() {
        let expected = Some(("JackJPowell".to_string(), "uc-intg-psn".to_string()));
        assert_eq!(parse_github_url("https://github.com/JackJPowell/uc-intg-psn"), expected);
        assert_eq!(parse_github_url("https://github.com/JackJPowell/uc-intg-psn/"), expected);
        assert_eq!(parse_github_url("https://github.com/JackJPowell/uc-intg-psn.git"), expected);
        assert_eq!(
            parse_github_url("https://github.com/JackJPowell/uc-intg-psn/releases/latest"),
            expected
        );
    }

    #[test]
    fn test_parse_github_url_rejects_other_hosts() {
        assert_eq!(parse_github_url("https://gitlab.com/owner/repo"), None);
        assert_eq!(parse_github_url("https://github.com/owner"), None);
        assert_eq!(parse_github_url(""), None);
    }

    #[test]
    fn test_artifact_version_strips_prefix() {
        let artifact = ReleaseArtifact {
            filename: "x.tar.gz".to_string(),
            bytes: vec![],
            tag_name: "v2.1.0".to_string(),
        };
        assert_eq!(artifact.version(), "2.1.0");
    }
}
