//! REST API implementation
//!
//! Serves the Alertmanager-compatible configuration API, the evaluation API
//! used by the live query runner, and alert instance administration.

pub mod handlers;
pub mod routes;

pub use handlers::AppState;
pub use routes::{create_router, CONFIG_API_PREFIX};

use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::configstore::ConfigStore;
use crate::error::{Error, Result};
use crate::evaluation::Evaluator;
use crate::state::StateManager;

/// HTTP API server
pub struct HttpServer {
    state: AppState,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(store: Arc<ConfigStore>, state: Arc<StateManager>, evaluator: Evaluator) -> Self {
        Self {
            state: AppState {
                store,
                state,
                evaluator,
            },
        }
    }

    /// Start the HTTP server
    pub async fn serve(self, addr: &str) -> Result<()> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = create_router(self.state)
            .layer(TraceLayer::new_for_http())
            .layer(cors);

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("HTTP server listening on {}", addr);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        Ok(())
    }
}
