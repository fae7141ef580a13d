pub mod config;
pub mod modules;
pub mod services;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use modules::metrics::metrics_routes;
use modules::status::controller::StatusState;
use modules::status::status_routes;
use services::relay::Relay;

/// Operational HTTP surface: health, metrics and component status.
/// The full serving layer (subscriptions, API keys, TLS) lives elsewhere
/// and consumes the relay through `Relay::subscribe`.
pub fn create_app(relay: Arc<Relay>) -> Router {
    let status_state = StatusState {
        manager: relay.manager.clone(),
        dedup: relay.dedup.clone(),
        cache: relay.cache.clone(),
    };

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .merge(metrics_routes(relay.metrics().clone()))
        .nest("/status", status_routes(status_state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn root() -> &'static str {
    "Block Relay"
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
