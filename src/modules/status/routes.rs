use axum::{routing::get, Router};

use super::controller::{cache_status, dedup_status, endpoint_status, StatusState};

pub fn status_routes(state: StatusState) -> Router {
    Router::new()
        .route("/endpoints/{chain}", get(endpoint_status))
        .route("/dedup", get(dedup_status))
        .route("/cache", get(cache_status))
        .with_state(state)
}
