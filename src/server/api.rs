use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::StoreError;
use crate::meta::format_timestamp;
use crate::storage::Store;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
}

#[derive(Debug, Deserialize)]
pub struct PackPath {
    pub family: String,
    pub release: String,
    pub pack: String,
    pub arch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CvePath {
    pub family: String,
    pub release: String,
    pub id: String,
    pub arch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartitionPath {
    pub family: String,
    pub release: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
}

// ============================================
// Handlers
// ============================================

pub async fn health() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Definitions affecting a package
pub async fn get_by_pack_name(
    State(state): State<AppState>,
    Path(path): Path<PackPath>,
) -> impl IntoResponse {
    debug!(
        family = %path.family,
        release = %path.release,
        pack = %path.pack,
        arch = ?path.arch,
        "Package lookup"
    );
    let result = state
        .store
        .get_by_pack_name(&path.family, &path.release, &path.pack, path.arch.as_deref())
        .await;
    respond(result.and_then(|defs| Ok(serde_json::to_value(defs)?)))
}

/// Definitions referencing a CVE
pub async fn get_by_cve_id(
    State(state): State<AppState>,
    Path(path): Path<CvePath>,
) -> impl IntoResponse {
    debug!(
        family = %path.family,
        release = %path.release,
        cve_id = %path.id,
        arch = ?path.arch,
        "CVE lookup"
    );
    let result = state
        .store
        .get_by_cve_id(&path.family, &path.release, &path.id, path.arch.as_deref())
        .await;
    respond(result.and_then(|defs| Ok(serde_json::to_value(defs)?)))
}

pub async fn count_definitions(
    State(state): State<AppState>,
    Path(path): Path<PartitionPath>,
) -> impl IntoResponse {
    let result = state
        .store
        .count_definitions(&path.family, &path.release)
        .await;
    respond(result.map(|count| json!({ "count": count })))
}

pub async fn get_last_modified(
    State(state): State<AppState>,
    Path(path): Path<PartitionPath>,
) -> impl IntoResponse {
    let result = state
        .store
        .get_last_modified(&path.family, &path.release)
        .await;
    respond(result.map(|ts| json!({ "last_modified": format_timestamp(&ts) })))
}

/// Bad family/release input is the caller's fault; anything else is ours.
fn respond(result: Result<Value, StoreError>) -> (StatusCode, Json<Value>) {
    match result {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) if e.is_normalize() => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": e.to_string() })),
        ),
        Err(e) => {
            error!(error = %e, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        }
    }
}
