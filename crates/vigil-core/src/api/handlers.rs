//! API handlers for the HTTP REST API

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::configstore::{ConfigStore, GettableApiReceiver, GettableUserConfig, PostableUserConfig};
use crate::error::Error;
use crate::evaluation::Evaluator;
use crate::live::{EvalRequest, EvalResponse};
use crate::models::{AlertInstance, Labels};
use crate::state::StateManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Alertmanager configuration
    pub store: Arc<ConfigStore>,
    /// Alert instance state
    pub state: Arc<StateManager>,
    /// Evaluator backing the evaluation API
    pub evaluator: Evaluator,
}

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Map an error to a status code; client errors keep their message verbatim
fn error_response(e: Error) -> (StatusCode, String) {
    match e {
        Error::ConfigValidation(msg) | Error::ConfigApply(msg) | Error::Validation(msg) => {
            (StatusCode::BAD_REQUEST, msg)
        }
        e @ Error::NotFound { .. } => (StatusCode::NOT_FOUND, e.to_string()),
        e => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    /// Always `ok`
    pub status: String,
    /// Crate version
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Plain acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Human readable outcome
    pub message: String,
}

/// Current Alertmanager configuration, secrets redacted
pub async fn get_alertmanager_config(State(state): State<AppState>) -> Json<GettableUserConfig> {
    Json(state.store.read())
}

/// Replace the Alertmanager configuration
pub async fn post_alertmanager_config(
    State(state): State<AppState>,
    Json(config): Json<PostableUserConfig>,
) -> ApiResult<(StatusCode, Json<MessageResponse>)> {
    let report = state.store.save(config).await.map_err(error_response)?;

    info!(unused_receivers = ?report.unused_receivers, "Alertmanager configuration saved");

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageResponse {
            message: "configuration created".to_string(),
        }),
    ))
}

/// One receiver, secrets redacted
pub async fn get_receiver(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<GettableApiReceiver>> {
    state
        .store
        .receiver(&name)
        .map(Json)
        .ok_or_else(|| error_response(Error::not_found("Receiver", name)))
}

/// Delete a receiver no route references
pub async fn delete_receiver(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<MessageResponse>> {
    state.store.delete_receiver(&name).await.map_err(error_response)?;

    Ok(Json(MessageResponse {
        message: "receiver deleted".to_string(),
    }))
}

/// A route an alert would be delivered through
#[derive(Debug, Serialize, Deserialize)]
pub struct MatchedRoute {
    /// Position of the route in the tree, e.g. `0/1`
    pub route_id: String,
    /// Receiver the route delivers to
    pub receiver: String,
}

/// Routes of the configuration in effect that an alert with these labels matches
pub async fn test_routes(
    State(state): State<AppState>,
    Json(labels): Json<Labels>,
) -> Json<Vec<MatchedRoute>> {
    let tree = state.store.route_tree();
    let matched = tree
        .match_labels(&labels)
        .into_iter()
        .map(|route| MatchedRoute {
            route_id: route.id.clone(),
            receiver: route.receiver.clone(),
        })
        .collect();
    Json(matched)
}

/// Evaluate an ad-hoc query batch
pub async fn evaluate(
    State(state): State<AppState>,
    Json(req): Json<EvalRequest>,
) -> ApiResult<Json<EvalResponse>> {
    if req.data.is_empty() {
        return Err(error_response(Error::validation("at least one query is required")));
    }

    let results = state.evaluator.evaluate_queries(&req.data, Utc::now()).await;
    Ok(Json(EvalResponse { results }))
}

/// Instance list query parameters
#[derive(Debug, Deserialize)]
pub struct ListInstancesQuery {
    /// Only instances of this rule
    pub rule_uid: Option<String>,
}

/// Tracked alert instances
pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<ListInstancesQuery>,
) -> Json<Vec<AlertInstance>> {
    Json(state.state.list(query.rule_uid.as_deref()))
}

/// Reset response
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    /// Number of instances dropped
    pub removed: usize,
}

/// Drop every instance of a rule
pub async fn reset_rule(State(state): State<AppState>, Path(uid): Path<String>) -> Json<ResetResponse> {
    let removed = state.state.reset(&uid);
    info!(rule_uid = %uid, removed, "Rule state reset");
    Json(ResetResponse { removed })
}
