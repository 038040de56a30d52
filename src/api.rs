//! HTTP API
//!
//! TigerStyle: Thin JSON handlers over the orchestrator.
//!
//! Status mapping: busy 409, not found 404, not manageable or invalid 400,
//! failed pipeline or internal error 500, otherwise 200.

use crate::config::Settings;
use crate::manager::{OperationError, Orchestrator};
use crate::pipeline::PipelineReport;
use crate::APP_VERSION;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

type AppState = Arc<Orchestrator>;

/// Optional release tag for update and install.
#[derive(Debug, Default, Deserialize)]
pub struct ReleaseQuery {
    pub tag: Option<String>,
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/integration/:id/update", post(update_integration))
        .route("/api/integration/:id/install", post(install))
        .route("/api/driver/:id/update", post(update_driver))
        .route("/api/driver/:id", delete(delete_driver))
        .route("/api/integrations", get(installed_integrations))
        .route("/api/versions", get(cached_versions))
        .route("/api/versions/check", post(check_versions))
        .route("/api/stats/updates-count", get(updates_count))
        .route("/api/settings", get(get_settings).post(save_settings))
        .route("/api/backup/all", post(backup_all))
        .route("/api/backup/:id", post(backup_driver).get(get_backup))
        .route("/api/backups", get(list_backups))
        .route("/api/backups/export", get(export_backups))
        .route("/api/backups/import", post(import_backups))
        .route("/api/backups/:id", delete(delete_backup))
        .with_state(state)
}

// =============================================================================
// Handlers
// =============================================================================

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok", "version": APP_VERSION}))
}

async fn status(State(orchestrator): State<AppState>) -> Json<serde_json::Value> {
    let holder = orchestrator.status();
    Json(json!({"busy": holder.is_some(), "operation": holder}))
}

async fn update_integration(
    State(orchestrator): State<AppState>,
    Path(instance_id): Path<String>,
    Query(query): Query<ReleaseQuery>,
) -> Response {
    report_response(orchestrator.update_integration(&instance_id, query.tag).await)
}

async fn update_driver(
    State(orchestrator): State<AppState>,
    Path(driver_id): Path<String>,
    Query(query): Query<ReleaseQuery>,
) -> Response {
    report_response(orchestrator.update_driver(&driver_id, query.tag).await)
}

async fn install(
    State(orchestrator): State<AppState>,
    Path(registry_id): Path<String>,
    Query(query): Query<ReleaseQuery>,
) -> Response {
    report_response(orchestrator.install(&registry_id, query.tag).await)
}

async fn delete_driver(State(orchestrator): State<AppState>, Path(driver_id): Path<String>) -> Response {
    match orchestrator.delete_driver(&driver_id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"deleted": driver_id}))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn backup_driver(State(orchestrator): State<AppState>, Path(driver_id): Path<String>) -> Response {
    match orchestrator.backup_driver(&driver_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("{} does not offer a configuration backup", driver_id)})),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn backup_all(State(orchestrator): State<AppState>) -> Response {
    match orchestrator.backup_all().await {
        Ok(summary) => {
            let code = if summary.is_success() {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (code, Json(summary)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn get_backup(State(orchestrator): State<AppState>, Path(driver_id): Path<String>) -> Response {
    match orchestrator.get_backup(&driver_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => error_response(OperationError::NotFound(format!("backup for {}", driver_id))),
        Err(e) => error_response(e),
    }
}

async fn list_backups(State(orchestrator): State<AppState>) -> Response {
    match orchestrator.list_backups().await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn delete_backup(State(orchestrator): State<AppState>, Path(driver_id): Path<String>) -> Response {
    match orchestrator.delete_backup(&driver_id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"deleted": driver_id}))).into_response(),
        Ok(false) => error_response(OperationError::NotFound(format!("backup for {}", driver_id))),
        Err(e) => error_response(e),
    }
}

async fn export_backups(State(orchestrator): State<AppState>) -> Response {
    match orchestrator.export_backups().await {
        Ok(document) => (StatusCode::OK, Json(document)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn import_backups(State(orchestrator): State<AppState>, Json(document): Json<serde_json::Value>) -> Response {
    match orchestrator.import_backups(document).await {
        Ok(summary) => (StatusCode::OK, Json(summary)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn get_settings(State(orchestrator): State<AppState>) -> Json<Settings> {
    Json(orchestrator.settings().await)
}

async fn save_settings(State(orchestrator): State<AppState>, Json(settings): Json<Settings>) -> Response {
    match orchestrator.save_settings(&settings).await {
        Ok(()) => (StatusCode::OK, Json(settings)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn installed_integrations(State(orchestrator): State<AppState>) -> Response {
    match orchestrator.installed_integrations().await {
        Ok(integrations) => (StatusCode::OK, Json(integrations)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn check_versions(State(orchestrator): State<AppState>) -> Response {
    match orchestrator.check_versions().await {
        Ok(report) => (StatusCode::OK, Json(report)).into_response(),
        Err(e) => error_response(e),
    }
}

async fn cached_versions(State(orchestrator): State<AppState>) -> Json<serde_json::Value> {
    match orchestrator.cached_versions() {
        Some(report) => Json(json!({"timestamp": report.timestamp, "versions": report.versions})),
        None => Json(json!({"timestamp": null, "versions": {}})),
    }
}

async fn updates_count(State(orchestrator): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({"count": orchestrator.updates_count()}))
}

// =============================================================================
// Responses
// =============================================================================

fn report_response(result: Result<PipelineReport, OperationError>) -> Response {
    match result {
        Ok(report) => {
            let code = if report.is_success() {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (code, Json(report)).into_response()
        }
        Err(e) => error_response(e),
    }
}

fn status_code(error: &OperationError) -> StatusCode {
    match error {
        OperationError::Busy { .. } => StatusCode::CONFLICT,
        OperationError::NotFound(_) => StatusCode::NOT_FOUND,
        OperationError::NotManageable(_) | OperationError::Invalid(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(error: OperationError) -> Response {
    let code = status_code(&error);
    if code.is_server_error() {
        tracing::error!(error = %error, "request failed");
    }
    let body = match &error {
        OperationError::Busy { holder } => json!({"error": error.to_string(), "operation": holder}),
        _ => json!({"error": error.to_string()}),
    };
    (code, Json(body)).into_response()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PacingConfig, RemoteConfig};
    use crate::lock::OperationKind;
    use crate::registry::{Registry, StaticRegistry};
    use crate::sim::{SimDevice, SimReleases};
    use crate::store::BackupStore;
    use tempfile::TempDir;

    async fn state() -> (AppState, Arc<SimDevice>, TempDir) {
        let dir = TempDir::new().unwrap();
        let device = Arc::new(SimDevice::new());
        let orchestrator = Orchestrator::new(
            device.clone(),
            Arc::new(SimReleases::new("v1.0.0")),
            Arc::new(StaticRegistry(Registry::default())),
            Arc::new(BackupStore::open(dir.path()).await.unwrap()),
            PacingConfig::immediate(),
            RemoteConfig::new("127.0.0.1"),
        );
        (Arc::new(orchestrator), device, dir)
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            status_code(&OperationError::NotFound("x".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_code(&OperationError::NotManageable("x".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_code(&OperationError::Remote(crate::remote::RemoteError::Transport("down".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_busy_is_conflict() {
        let (state, _device, _dir) = state().await;
        let _held = state.lock().try_acquire(OperationKind::BackupAll, "all").unwrap();

        let response = delete_driver(State(state.clone()), Path("psn".to_string())).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let Json(body) = status(State(state.clone())).await;
        assert_eq!(body["busy"], true);
        assert_eq!(body["operation"]["kind"], "backup_all");
    }

    #[tokio::test]
    async fn test_missing_backup_is_not_found() {
        let (state, _device, _dir) = state().await;
        let response = get_backup(State(state), Path("psn".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_update_unknown_instance() {
        let (state, _device, _dir) = state().await;
        let response = update_integration(
            State(state),
            Path("ghost.main".to_string()),
            Query(ReleaseQuery::default()),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_backup_all_empty_succeeds() {
        let (state, _device, _dir) = state().await;
        let response = backup_all(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.status().is_none());
    }

    #[tokio::test]
    async fn test_settings_round_trip_and_validation() {
        let (state, _device, _dir) = state().await;

        let mut settings = Settings::default();
        settings.backup_configs = true;
        let response = save_settings(State(state.clone()), Json(settings.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let Json(stored) = get_settings(State(state.clone())).await;
        assert_eq!(stored, settings);

        settings.backup_time = "noon".to_string();
        let response = save_settings(State(state.clone()), Json(settings)).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_backup_import_delete() {
        let (state, _device, _dir) = state().await;

        let response = import_backups(State(state.clone()), Json(json!({"integrations": {}}))).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let document = json!({
            "version": "1.0",
            "integrations": {"psn": {"data": "{}", "timestamp": "2026-10-18T02:00:00+00:00"}}
        });
        let response = import_backups(State(state.clone()), Json(document)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(export_backups(State(state.clone())).await.status(), StatusCode::OK);

        let response = delete_backup(State(state.clone()), Path("psn".to_string())).await;
        assert_eq!(response.status(), StatusCode::OK);
        let response = delete_backup(State(state), Path("psn".to_string())).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_versions_before_and_after_check() {
        let (state, device, _dir) = state().await;
        device.add_driver("psn", "0.9.0");

        let Json(cached) = cached_versions(State(state.clone())).await;
        assert!(cached["timestamp"].is_null());

        // no registry entry and no home page: nothing to check
        assert_eq!(check_versions(State(state.clone())).await.status(), StatusCode::OK);
        let Json(count) = updates_count(State(state.clone())).await;
        assert_eq!(count["count"], 0);
        let Json(cached) = cached_versions(State(state)).await;
        assert!(cached["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_router_builds() {
        let (state, _device, _dir) = state().await;
        let _router = router(state);
    }
}
