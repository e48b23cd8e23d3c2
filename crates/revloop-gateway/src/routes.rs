use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, error, info};

use revloop_core::error::RevloopError;
use revloop_core::review::SessionSnapshot;
use revloop_core::types::SessionId;

use crate::state::AppState;

/// Orchestrator errors rendered as JSON with a matching status code.
pub struct ApiError(RevloopError);

impl From<RevloopError> for ApiError {
    fn from(e: RevloopError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let message = self.0.to_string();
        let (status, body) = match self.0 {
            RevloopError::UnknownSession(_) => (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": message }),
            ),
            RevloopError::InvalidDecision(_) | RevloopError::InvalidInput(_) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": message }),
            ),
            RevloopError::SessionConflict(_) => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": message }),
            ),
            RevloopError::TerminalSession { snapshot, .. } => (
                StatusCode::CONFLICT,
                serde_json::json!({ "error": message, "snapshot": snapshot }),
            ),
            RevloopError::GenerationFailure(_) => (
                StatusCode::BAD_GATEWAY,
                serde_json::json!({ "error": message }),
            ),
            _ => {
                error!(error = %message, "Request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({ "error": message }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "max_attempts": state.orchestrator.policy().max_attempts,
    }))
}

#[derive(Deserialize)]
pub struct StartBody {
    pub input: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

// POST /api/reviews
pub async fn start_review(
    State(state): State<Arc<AppState>>,
    Json(body): Json<StartBody>,
) -> ApiResult<(StatusCode, Json<SessionSnapshot>)> {
    let snapshot = match body.session_id.filter(|id| !id.trim().is_empty()) {
        Some(id) => {
            state
                .orchestrator
                .start_with_id(SessionId::from_string(id.trim()), &body.input)
                .await?
        }
        None => state.orchestrator.start(&body.input).await?,
    };
    info!(session_id = %snapshot.session_id, "Review started via API");
    Ok((StatusCode::CREATED, Json(snapshot)))
}

// GET /api/reviews
pub async fn list_reviews(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let sessions = state.orchestrator.list().await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

// GET /api/reviews/{id}
pub async fn get_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SessionSnapshot>> {
    let snapshot = state
        .orchestrator
        .snapshot(&SessionId::from_string(&id))
        .await?;
    Ok(Json(snapshot))
}

#[derive(Deserialize)]
pub struct DecisionBody {
    pub decision: String,
    #[serde(default)]
    pub feedback: Option<String>,
}

// POST /api/reviews/{id}/decision
pub async fn submit_decision(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DecisionBody>,
) -> ApiResult<Json<SessionSnapshot>> {
    debug!(session_id = %id, decision = %body.decision, "Decision received via API");
    let snapshot = state
        .orchestrator
        .resume(
            &SessionId::from_string(&id),
            &body.decision,
            body.feedback.as_deref(),
        )
        .await?;
    Ok(Json(snapshot))
}

// DELETE /api/reviews/{id}
pub async fn discard_review(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .orchestrator
        .discard(&SessionId::from_string(&id))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
