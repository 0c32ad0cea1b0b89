use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers::{backups, system};
use crate::state::AppState;

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(system::health))
        // Backups
        .route("/api/client/servers/{server}/backups", get(backups::list_backups))
        .route("/api/client/servers/{server}/backups/{backup}", get(backups::get_backup))
        .route("/api/client/servers/{server}/backups/{backup}", delete(backups::delete_backup))
        .route("/api/client/servers/{server}/backups/{backup}/lock", post(backups::toggle_lock))
        .with_state(state)
}
