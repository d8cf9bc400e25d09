//! API Router configuration

use super::handlers::{get_languages, health_check, list_sessions, update_languages, AppState};
use super::media_stream::media_handler;
use super::metrics_handler::metrics_handler;
use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the API router
pub fn build_router(state: AppState, prometheus_handle: PrometheusHandle) -> Router {
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/sessions", get(list_sessions))
        .route("/languages", get(get_languages).put(update_languages));

    let media_routes = Router::new().route("/media", get(media_handler));

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    Router::new()
        .merge(api_routes)
        .merge(media_routes)
        .with_state(state)
        .merge(metrics_routes)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
