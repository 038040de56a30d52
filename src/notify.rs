//! Notifications
//!
//! TigerStyle: Best-effort delivery, never fails the caller.
//!
//! Providers:
//! - webhook: `POST` a JSON `{title, message, ...}` body with custom headers
//! - ntfy: `POST {server}/{topic}` with the message as the body and
//!   `Title`/`Priority`/`Tags` headers
//!
//! Whether a notification was already delivered is tracked by the caller
//! (see [`crate::store::BackupStore::mark_notified`]).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Timeout for one delivery
pub const NOTIFY_TIMEOUT_SECS: u64 = 10;

/// Public ntfy server
pub const NTFY_SERVER_DEFAULT: &str = "https://ntfy.sh";

/// ntfy priority range
pub const NTFY_PRIORITY_MIN: u8 = 1;
pub const NTFY_PRIORITY_MAX: u8 = 5;

// =============================================================================
// Settings
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    /// Extra request headers
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NtfyConfig {
    pub enabled: bool,
    pub server: String,
    pub topic: String,
    /// Access token for protected topics
    pub token: Option<String>,
}

impl Default for NtfyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server: NTFY_SERVER_DEFAULT.to_string(),
            topic: String::new(),
            token: None,
        }
    }
}

/// Which events notify.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationTriggers {
    pub integration_update_available: bool,
}

impl Default for NotificationTriggers {
    fn default() -> Self {
        Self {
            integration_update_available: true,
        }
    }
}

/// Notification providers and triggers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub webhook: WebhookConfig,
    pub ntfy: NtfyConfig,
    pub triggers: NotificationTriggers,
}

impl NotificationSettings {
    pub fn webhook_ready(&self) -> bool {
        self.webhook.enabled && !self.webhook.url.trim().is_empty()
    }

    pub fn ntfy_ready(&self) -> bool {
        self.ntfy.enabled && !self.ntfy.server.trim().is_empty() && !self.ntfy.topic.trim().is_empty()
    }

    pub fn is_any_enabled(&self) -> bool {
        self.webhook_ready() || self.ntfy_ready()
    }
}

/// One notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    /// ntfy priority, clamped to 1..=5
    pub priority: u8,
    pub tags: Vec<String>,
    /// Extra fields merged into the webhook body
    pub data: BTreeMap<String, String>,
}

impl Notification {
    /// "update available" for one driver.
    pub fn update_available(driver_id: &str, name: &str, current: &str, latest: &str) -> Self {
        let data = [
            ("event", "integration_update_available"),
            ("driver_id", driver_id),
            ("current_version", current),
            ("latest_version", latest),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            title: "Integration Update Available".to_string(),
            message: format!("{} can be updated from {} to {}", name, current, latest),
            priority: 3,
            tags: vec!["package".to_string()],
            data,
        }
    }

    fn webhook_body(&self) -> Value {
        let mut body = json!({
            "title": self.title,
            "message": self.message,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Value::Object(map) = &mut body {
            for (key, value) in &self.data {
                map.insert(key.clone(), Value::String(value.clone()));
            }
        }
        body
    }
}

// =============================================================================
// Notifier
// =============================================================================

/// Sends notifications to every configured provider.
#[derive(Clone, Default)]
pub struct Notifier {
    http: reqwest::Client,
}

impl Notifier {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(NOTIFY_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self { http }
    }

    /// Deliver to every ready provider. Returns how many accepted it.
    pub async fn send_all(&self, settings: &NotificationSettings, notification: &Notification) -> usize {
        let mut delivered = 0;
        if settings.webhook_ready() {
            match self.send_webhook(&settings.webhook, notification).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::error!(provider = "webhook", error = %e, "notification failed"),
            }
        }
        if settings.ntfy_ready() {
            match self.send_ntfy(&settings.ntfy, notification).await {
                Ok(()) => delivered += 1,
                Err(e) => tracing::error!(provider = "ntfy", error = %e, "notification failed"),
            }
        }
        delivered
    }

    pub async fn send_webhook(&self, config: &WebhookConfig, notification: &Notification) -> Result<(), NotifyError> {
        let mut request = self.http.post(&config.url).json(&notification.webhook_body());
        for (name, value) in &config.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        check(response).await?;
        tracing::info!(title = %notification.title, "notification sent via webhook");
        Ok(())
    }

    pub async fn send_ntfy(&self, config: &NtfyConfig, notification: &Notification) -> Result<(), NotifyError> {
        let url = format!("{}/{}", config.server.trim_end_matches('/'), config.topic);
        let priority = notification.priority.clamp(NTFY_PRIORITY_MIN, NTFY_PRIORITY_MAX);

        let mut request = self
            .http
            .post(url)
            .header("Title", notification.title.as_str())
            .header("Priority", priority.to_string())
            .body(notification.message.clone());
        if !notification.tags.is_empty() {
            request = request.header("Tags", notification.tags.join(","));
        }
        if let Some(token) = config.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        check(response).await?;
        tracing::info!(title = %notification.title, "notification sent via ntfy");
        Ok(())
    }
}

async fn check(response: reqwest::Response) -> Result<(), NotifyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    Err(NotifyError::Rejected {
        status: status.as_u16(),
        body,
    })
}

// =============================================================================
// Errors
// =============================================================================

/// Notification delivery errors
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("provider returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

// =============================================================================
// Tests
// =============================================================================
