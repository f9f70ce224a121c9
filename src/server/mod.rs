//! HTTP trigger and polling surface.

pub mod error;
pub mod scheduler;

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::backup::artifact::{BackupArtifact, BackupTrigger};
use crate::backup::progress::ProgressState;
use crate::backup::retention::RetentionReport;
use crate::backup::{BackupOrchestrator, RunOutcome};
use crate::utils::format_bytes;
use error::ApiError;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<BackupOrchestrator>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/backup/create", post(create_backup))
        .route("/backup/status", get(current_status))
        .route("/backup/status/{run_id}", get(run_status))
        .route("/backup/list", get(list_backups))
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateBackupQuery {
    #[serde(default)]
    pub manual: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegritySummary {
    pub checksum: String,
    pub record_count: u64,
    pub tables_count: usize,
    pub validated: bool,
    pub is_valid: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSummary {
    pub file_name: String,
    pub size: u64,
    pub size_formatted: String,
    pub timestamp: String,
    pub location: String,
    #[serde(rename = "type")]
    pub trigger: BackupTrigger,
    pub method: String,
    pub integrity: IntegritySummary,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBackupResponse {
    pub success: bool,
    pub run_id: Uuid,
    pub backup: BackupSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention: Option<RetentionReport>,
    pub diagnostics: Vec<String>,
}

impl From<RunOutcome> for CreateBackupResponse {
    fn from(outcome: RunOutcome) -> Self {
        let artifact = outcome.artifact;
        Self {
            success: true,
            run_id: outcome.run_id,
            backup: BackupSummary {
                size_formatted: format_bytes(artifact.size_bytes),
                size: artifact.size_bytes,
                timestamp: artifact.created_at.to_rfc3339(),
                location: outcome.location,
                trigger: artifact.trigger,
                method: artifact.method.to_string(),
                integrity: IntegritySummary {
                    checksum: artifact.checksum,
                    record_count: artifact.record_count,
                    tables_count: artifact.table_count,
                    validated: artifact.validated,
                    is_valid: outcome.integrity.is_valid,
                },
                file_name: artifact.file_name,
            },
            retention: outcome.retention,
            diagnostics: outcome.diagnostics,
        }
    }
}

/// GET /health
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /backup/create?manual=<bool> - runs a backup and waits for it. The
/// run continues if the client goes away.
async fn create_backup(
    State(state): State<AppState>,
    Query(query): Query<CreateBackupQuery>,
) -> Result<Json<CreateBackupResponse>, ApiError> {
    let trigger = BackupTrigger::from_manual_flag(query.manual);
    tracing::info!(trigger = %trigger, "Backup requested over HTTP");
    let outcome = state.orchestrator.clone().run_detached(trigger).await?;
    Ok(Json(outcome.into()))
}

/// GET /backup/status
async fn current_status(State(state): State<AppState>) -> Json<ProgressState> {
    Json(state.orchestrator.progress().current().await)
}

/// GET /backup/status/{run_id}
async fn run_status(
    State(state): State<AppState>,
    Path(run_id): Path<Uuid>,
) -> Result<Json<ProgressState>, ApiError> {
    state
        .orchestrator
        .progress()
        .get(run_id)
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no backup run with id {}", run_id)))
}

/// GET /backup/list
async fn list_backups(State(state): State<AppState>) -> Result<Json<Vec<BackupArtifact>>, ApiError> {
    Ok(Json(state.orchestrator.list_artifacts().await?))
}
