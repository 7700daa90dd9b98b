//! REST endpoints for the flow engine.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::error::{ConfigError, DatabaseError, Error, FlowError};
use crate::store::SessionRecord;

use super::engine::{FlowEngine, TurnRequest, TurnResponse};
use super::phase_config::PhaseCfg;

/// Shared state for flow routes.
#[derive(Clone)]
pub struct FlowRouteState {
    pub engine: Arc<FlowEngine>,
}

/// An engine error on its way out as an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Config(ConfigError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Config(_) => StatusCode::BAD_REQUEST,
            Error::Flow(FlowError::InvalidJump { .. }) => StatusCode::BAD_REQUEST,
            Error::Flow(_) => StatusCode::CONFLICT,
            Error::Database(DatabaseError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Database(DatabaseError::VersionConflict { .. }) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        }
        (status, Json(serde_json::json!({"error": self.0.to_string()}))).into_response()
    }
}

/// POST /api/flow/turn
///
/// Process one user turn and return the reply with the updated state.
async fn post_turn(
    State(state): State<FlowRouteState>,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnResponse>, ApiError> {
    Ok(Json(state.engine.handle_turn(request).await?))
}

/// GET /api/flow/sessions/{id}
async fn get_session(
    State(state): State<FlowRouteState>,
    Path(session_id): Path<String>,
) -> Result<Json<SessionRecord>, ApiError> {
    match state.engine.session(&session_id).await? {
        Some(record) => Ok(Json(record)),
        None => Err(ApiError(
            DatabaseError::NotFound {
                entity: "session".into(),
                id: session_id,
            }
            .into(),
        )),
    }
}

/// GET /api/flow/phases
///
/// The enabled phases as the next turn would see them.
async fn get_phases(State(state): State<FlowRouteState>) -> Json<Vec<PhaseCfg>> {
    let table = state.engine.phase_table().await;
    Json(table.enabled().cloned().collect())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Build the flow REST routes.
pub fn flow_routes(engine: Arc<FlowEngine>) -> Router {
    Router::new()
        .route("/api/flow/turn", post(post_turn))
        .route("/api/flow/sessions/{id}", get(get_session))
        .route("/api/flow/phases", get(get_phases))
        .route("/health", get(health))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(FlowRouteState { engine })
}
