//! API routes

use axum::{
    routing::{get, post},
    Router,
};

use super::handlers::{self, AppState};

/// Prefix of the Alertmanager-compatible configuration API
pub const CONFIG_API_PREFIX: &str = "/api/alertmanager/grafana/config/api/v1";

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/health", get(handlers::health))

        // Alertmanager configuration
        .route(
            &format!("{CONFIG_API_PREFIX}/alerts"),
            get(handlers::get_alertmanager_config).post(handlers::post_alertmanager_config),
        )
        .route(
            &format!("{CONFIG_API_PREFIX}/receivers/:name"),
            get(handlers::get_receiver).delete(handlers::delete_receiver),
        )
        .route("/api/v1/routes/test", post(handlers::test_routes))

        // Evaluation
        .route("/api/v1/eval", post(handlers::evaluate))

        // Alert state
        .route("/api/v1/rules/instances", get(handlers::list_instances))
        .route("/api/v1/rules/:uid/reset", post(handlers::reset_rule))

        .with_state(state)
}
