//! HTTP client for the remote's REST API.

use super::{
    DeviceApi, DriverInfo, EntityFilter, EntityInfo, InstanceInfo, RemoteError, SetupInputs,
    ENTITY_LIST_LIMIT_DEFAULT, LIST_LIMIT_DEFAULT,
};
use crate::config::{RemoteConfig, REMOTE_PIN_USER};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

// =============================================================================
// TigerStyle Constants
// =============================================================================

/// Connect timeout for every request
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Total timeout for ordinary API requests
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Total timeout for driver package uploads
pub const UPLOAD_TIMEOUT_SECS: u64 = 120;

/// Content type the remote expects for driver packages
pub const PACKAGE_CONTENT_TYPE: &str = "application/x-gzip";

const AUTH_FAILED_MESSAGE: &str = "Authentication failed. Check PIN or API key.";
const AUTH_FORBIDDEN_MESSAGE: &str = "Access forbidden. PIN may have changed.";

// =============================================================================
// Client
// =============================================================================

/// `reqwest`-backed [`DeviceApi`].
///
/// Authenticates with the API key (Bearer) when configured, otherwise with
/// the web configurator PIN (Basic).
#[derive(Clone)]
pub struct RemoteClient {
    http: reqwest::Client,
    config: RemoteConfig,
    base_url: String,
}

impl RemoteClient {
    /// Build a client for the given remote.
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let base_url = config.base_url();
        Self::with_base_url(config, base_url)
    }

    /// Build a client against an explicit API base URL.
    pub fn with_base_url(config: RemoteConfig, base_url: impl Into<String>) -> Result<Self, RemoteError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| RemoteError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            config,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.http.request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = self.config.api_key() {
            builder.bearer_auth(key)
        } else if let Some(pin) = self.config.pin() {
            builder.basic_auth(REMOTE_PIN_USER, Some(pin))
        } else {
            builder
        }
    }

    /// Send a request and return the decoded body (`Null` for an empty body).
    async fn send(&self, builder: RequestBuilder) -> Result<Value, RemoteError> {
        let response = builder.send().await.map_err(RemoteError::from)?;
        let status = response.status();
        let body = response.text().await.map_err(RemoteError::from)?;

        check_status(status, &body)?;

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn send_as<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, RemoteError> {
        let value = self.send(builder).await?;
        let value = if value.is_null() { json!([]) } else { value };
        serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))
    }
}

fn check_status(status: StatusCode, body: &str) -> Result<(), RemoteError> {
    match status {
        StatusCode::UNAUTHORIZED => Err(RemoteError::Auth(AUTH_FAILED_MESSAGE.to_string())),
        StatusCode::FORBIDDEN => Err(RemoteError::Auth(AUTH_FORBIDDEN_MESSAGE.to_string())),
        s if s.is_client_error() || s.is_server_error() => Err(RemoteError::Api {
            status: s.as_u16(),
            body: body.to_string(),
        }),
        _ => Ok(()),
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            RemoteError::Transport(error.to_string())
        } else if error.is_decode() {
            RemoteError::Decode(error.to_string())
        } else if let Some(status) = error.status() {
            RemoteError::Api {
                status: status.as_u16(),
                body: error.to_string(),
            }
        } else {
            RemoteError::Transport(error.to_string())
        }
    }
}

#[async_trait]
impl DeviceApi for RemoteClient {
    async fn start_setup(&self, driver_id: &str, reconfigure: bool) -> Result<Value, RemoteError> {
        tracing::debug!(driver_id = %driver_id, reconfigure, "POST /intg/setup");
        let body = json!({
            "driver_id": driver_id,
            "reconfigure": reconfigure,
            "setup_data": {},
        });
        self.send(self.request(Method::POST, "/intg/setup").json(&body)).await
    }

    async fn get_setup(&self, driver_id: &str) -> Result<Value, RemoteError> {
        tracing::debug!(driver_id = %driver_id, "GET /intg/setup");
        self.send(self.request(Method::GET, &format!("/intg/setup/{}", driver_id)))
            .await
    }

    async fn send_setup_input(
        &self,
        driver_id: &str,
        inputs: &SetupInputs,
    ) -> Result<Value, RemoteError> {
        tracing::debug!(
            driver_id = %driver_id,
            fields = ?inputs.keys().collect::<Vec<_>>(),
            "PUT /intg/setup"
        );
        let body = json!({ "input_values": inputs });
        self.send(
            self.request(Method::PUT, &format!("/intg/setup/{}", driver_id))
                .json(&body),
        )
        .await
    }

    async fn delete_setup(&self, driver_id: &str) -> Result<(), RemoteError> {
        tracing::debug!(driver_id = %driver_id, "DELETE /intg/setup");
        self.send(self.request(Method::DELETE, &format!("/intg/setup/{}", driver_id)))
            .await
            .map(|_| ())
    }

    async fn get_driver(&self, driver_id: &str) -> Result<Option<DriverInfo>, RemoteError> {
        let result = self
            .send(self.request(Method::GET, &format!("/intg/drivers/{}", driver_id)))
            .await;
        match result {
            Ok(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| RemoteError::Decode(e.to_string())),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_drivers(&self) -> Result<Vec<DriverInfo>, RemoteError> {
        self.send_as(
            self.request(Method::GET, "/intg/drivers")
                .query(&[("limit", LIST_LIMIT_DEFAULT)]),
        )
        .await
    }

    async fn list_instances(&self) -> Result<Vec<InstanceInfo>, RemoteError> {
        self.send_as(
            self.request(Method::GET, "/intg/instances")
                .query(&[("limit", LIST_LIMIT_DEFAULT)]),
        )
        .await
    }

    async fn list_enabled_instances(&self) -> Result<Vec<InstanceInfo>, RemoteError> {
        self.send_as(self.request(Method::GET, "/intg/instances").query(&[
            ("enabled", "true"),
            ("limit", "50"),
            ("page", "1"),
        ]))
        .await
    }

    async fn get_instance(&self, instance_id: &str) -> Result<InstanceInfo, RemoteError> {
        let value = self
            .send(self.request(Method::GET, &format!("/intg/instances/{}", instance_id)))
            .await?;
        serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))
    }

    async fn list_instance_entities(
        &self,
        instance_id: &str,
        filter: EntityFilter,
    ) -> Result<Vec<EntityInfo>, RemoteError> {
        let limit = ENTITY_LIST_LIMIT_DEFAULT.to_string();
        let mut query = vec![("reload", "true"), ("limit", limit.as_str()), ("page", "1")];
        if let Some(filter) = filter.as_query() {
            query.push(("filter", filter));
        }
        self.send_as(
            self.request(Method::GET, &format!("/intg/instances/{}/entities", instance_id))
                .query(&query),
        )
        .await
    }

    async fn register_entities(
        &self,
        instance_id: &str,
        entity_ids: Option<&[String]>,
    ) -> Result<(), RemoteError> {
        let builder =
            self.request(Method::POST, &format!("/intg/instances/{}/entities", instance_id));
        let builder = match entity_ids {
            Some(ids) if !ids.is_empty() => {
                tracing::debug!(instance_id = %instance_id, count = ids.len(), "registering entities");
                builder.json(ids)
            }
            _ => {
                tracing::debug!(instance_id = %instance_id, "registering all entities");
                builder
            }
        };
        self.send(builder).await.map(|_| ())
    }

    async fn delete_all_entities(&self, instance_id: &str) -> Result<(), RemoteError> {
        tracing::info!(instance_id = %instance_id, "deleting all entities");
        self.send(
            self.request(Method::DELETE, "/entities")
                .json(&json!({ "integration_id": instance_id })),
        )
        .await
        .map(|_| ())
    }

    async fn delete_driver(&self, driver_id: &str) -> Result<(), RemoteError> {
        tracing::info!(driver_id = %driver_id, "deleting driver");
        self.send(self.request(Method::DELETE, &format!("/intg/drivers/{}", driver_id)))
            .await
            .map(|_| ())
    }

    async fn install_driver(&self, package: Vec<u8>, filename: &str) -> Result<Value, RemoteError> {
        tracing::info!(filename = %filename, bytes = package.len(), "uploading driver package");
        let part = reqwest::multipart::Part::bytes(package)
            .file_name(filename.to_string())
            .mime_str(PACKAGE_CONTENT_TYPE)
            .map_err(|e| RemoteError::Decode(e.to_string()))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let value = self
            .send(
                self.request(Method::POST, "/intg/install")
                    .timeout(Duration::from_secs(UPLOAD_TIMEOUT_SECS))
                    .multipart(form),
            )
            .await?;
        Ok(if value.is_null() { json!({"status": "ok"}) } else { value })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_status_mapping() {
        assert!(check_status(StatusCode::OK, "").is_ok());
        assert!(check_status(StatusCode::NO_CONTENT, "").is_ok());
        assert!(matches!(
            check_status(StatusCode::UNAUTHORIZED, ""),
            Err(RemoteError::Auth(msg)) if msg == AUTH_FAILED_MESSAGE
        ));
        assert!(matches!(
            check_status(StatusCode::FORBIDDEN, ""),
            Err(RemoteError::Auth(msg)) if msg == AUTH_FORBIDDEN_MESSAGE
        ));
        assert!(matches!(
            check_status(StatusCode::NOT_FOUND, "gone"),
            Err(RemoteError::Api { status: 404, ref body }) if body == "gone"
        ));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client =
            RemoteClient::with_base_url(RemoteConfig::new("remote"), "http://localhost:1234/api/")
                .unwrap();
        assert_eq!(client.base_url, "http://localhost:1234/api");
    }
}
