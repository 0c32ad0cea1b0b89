use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use everest_common::BackupRecord;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::services::delete_backup::DeletionError;
use crate::state::AppState;

const DEFAULT_PER_PAGE: u64 = 20;

#[derive(Deserialize, Default)]
pub struct ListBackupsQuery {
    pub page: Option<u64>,
    pub per_page: Option<u64>,
}

// ── GET /api/client/servers/{server}/backups ──

pub async fn list_backups(
    State(state): State<Arc<AppState>>,
    Path(server): Path<Uuid>,
    Query(query): Query<ListBackupsQuery>,
) -> impl IntoResponse {
    let page = match state
        .store
        .list_backups(
            server,
            query.page.unwrap_or(1),
            query.per_page.unwrap_or(DEFAULT_PER_PAGE),
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(error_json("internal", &e.to_string())));
        }
    };

    let data: Vec<_> = page.items.iter().map(backup_json).collect();
    let total_pages = page.total.div_ceil(page.per_page);

    (StatusCode::OK, Json(serde_json::json!({
        "object": "list",
        "data": data,
        "meta": {
            "backup_count": page.backup_count,
            "pagination": {
                "total": page.total,
                "count": data.len(),
                "per_page": page.per_page,
                "current_page": page.page,
                "total_pages": total_pages,
            },
        },
    })))
}

// ── GET /api/client/servers/{server}/backups/{backup} ──

pub async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path((server, backup)): Path<(Uuid, Uuid)>,
) -> impl IntoResponse {
    match state.store.find_backup(server, backup).await {
        Ok(Some(record)) => (StatusCode::OK, Json(backup_json(&record))),
        Ok(None) => not_found(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(error_json("internal", &e.to_string()))),
    }
}

// ── POST /api/client/servers/{server}/backups/{backup}/lock ──

pub async fn toggle_lock(
    State(state): State<Arc<AppState>>,
    Path((server, backup)): Path<(Uuid, Uuid)>,
) -> impl IntoResponse {
    let record = match state.store.find_backup(server, backup).await {
        Ok(Some(r)) => r,
        Ok(None) => return not_found(),
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(error_json("internal", &e.to_string())));
        }
    };

    let locked = match state.store.toggle_locked(record.id).await {
        Ok(Some(locked)) => locked,
        Ok(None) => return not_found(),
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(error_json("internal", &e.to_string())));
        }
    };
    info!(backup = %record.uuid, server = %server, locked, "Backup lock toggled");

    (StatusCode::OK, Json(backup_json(&BackupRecord { is_locked: locked, ..record })))
}

// ── DELETE /api/client/servers/{server}/backups/{backup} ──

pub async fn delete_backup(
    State(state): State<Arc<AppState>>,
    Path((server, backup)): Path<(Uuid, Uuid)>,
) -> Response {
    let record = match state.store.find_backup(server, backup).await {
        Ok(Some(r)) => r,
        Ok(None) => return not_found().into_response(),
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(error_json("internal", &e.to_string())))
                .into_response();
        }
    };

    // Detached so a client hanging up cannot cancel a half-finished deletion.
    match state.delete_backups.handle_detached(record).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => deletion_error_response(&e),
    }
}

fn deletion_error_response(err: &DeletionError) -> Response {
    match err {
        DeletionError::Locked => {
            (StatusCode::CONFLICT, Json(error_json("backup_locked", &err.to_string()))).into_response()
        }
        // Another request removed it between lookup and delete; the caller got
        // what it asked for.
        DeletionError::NotFound(_) => StatusCode::NO_CONTENT.into_response(),
        DeletionError::Storage(_) | DeletionError::Transaction(_) | DeletionError::Task(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(error_json("internal", &err.to_string())),
        )
            .into_response(),
    }
}

fn backup_json(backup: &BackupRecord) -> serde_json::Value {
    serde_json::json!({
        "object": "backup",
        "attributes": {
            "uuid": backup.uuid,
            "name": backup.name,
            "disk": backup.disk,
            "is_successful": backup.is_successful,
            "is_locked": backup.is_locked,
            "checksum": backup.checksum,
            "bytes": backup.bytes,
            "created_at": backup.created_at.to_rfc3339(),
            "completed_at": backup.completed_at.map(|ts| ts.to_rfc3339()),
        },
    })
}

fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::NOT_FOUND, Json(error_json("not_found", "Backup not found")))
}

fn error_json(code: &str, message: &str) -> serde_json::Value {
    serde_json::json!({ "error": { "code": code, "message": message } })
}
