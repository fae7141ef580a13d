use axum::{routing::get, Router};
use std::sync::Arc;

use super::controller::get_metrics;
use crate::services::metrics::RelayMetrics;

pub fn metrics_routes(metrics: Arc<RelayMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(metrics)
}
