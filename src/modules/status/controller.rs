use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::str::FromStr;
use std::sync::Arc;

use crate::services::cache::BlockCache;
use crate::services::dedup::Deduplicator;
use crate::services::endpoint::ConnectionManager;
use crate::services::event::Chain;

/// Shared handles for the status surface
#[derive(Clone)]
pub struct StatusState {
    pub manager: Arc<ConnectionManager>,
    pub dedup: Arc<Deduplicator>,
    pub cache: Arc<BlockCache>,
}

/// Handler for GET /status/endpoints/{chain}
pub async fn endpoint_status(
    State(state): State<StatusState>,
    Path(chain): Path<String>,
) -> Response {
    match Chain::from_str(&chain) {
        Ok(chain) => Json(state.manager.endpoint_statuses(chain)).into_response(),
        Err(message) => (StatusCode::BAD_REQUEST, message).into_response(),
    }
}

/// Handler for GET /status/dedup
pub async fn dedup_status(State(state): State<StatusState>) -> Response {
    Json(state.dedup.stats()).into_response()
}

/// Handler for GET /status/cache
pub async fn cache_status(State(state): State<StatusState>) -> Response {
    Json(state.cache.stats()).into_response()
}
