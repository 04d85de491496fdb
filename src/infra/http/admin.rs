//! Administrative cache endpoints: key dump and purge.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
};
use serde::Serialize;
use tracing::info;

use crate::cache::OutputCache;

#[derive(Clone)]
pub struct AdminState {
    pub cache: OutputCache,
}

#[derive(Debug, Serialize)]
struct KeysListing {
    count: usize,
    keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct PurgeReport {
    removed: usize,
}

pub fn build_admin_router(cache: OutputCache) -> Router {
    Router::new()
        .route("/_health", get(admin_health))
        .route("/keys", get(list_keys).delete(clear_keys))
        .route("/keys/{prefix}", delete(purge_prefix))
        .with_state(AdminState { cache })
}

async fn admin_health() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

async fn list_keys(State(state): State<AdminState>) -> Json<KeysListing> {
    let keys = state.cache.keys_listing();
    Json(KeysListing {
        count: keys.len(),
        keys,
    })
}

async fn purge_prefix(
    State(state): State<AdminState>,
    Path(prefix): Path<String>,
) -> Json<PurgeReport> {
    let removed = state.cache.purge(&prefix);
    info!(cache = "admin", prefix = %prefix, removed, "purged by prefix");
    Json(PurgeReport { removed })
}

async fn clear_keys(State(state): State<AdminState>) -> Json<PurgeReport> {
    let removed = state.cache.clear();
    info!(cache = "admin", removed, "cleared cache");
    Json(PurgeReport { removed })
}
