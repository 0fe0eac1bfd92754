//! JSON endpoints for starting queries, backfilling tool results, and
//! cancelling sessions.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use blockrelay_core::ids::{QueryId, SessionId};
use blockrelay_core::tools::ToolResponse;
use blockrelay_engine::{QueryHandle, QueryRequest, SwitchReason};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitQueryBody {
    #[serde(default)]
    pub session_id: Option<SessionId>,
    pub query: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub switch_reason: Option<SwitchReason>,
}

#[derive(Debug, Deserialize)]
pub struct ToolResponsesBody {
    pub session_id: SessionId,
    pub responses: Vec<ToolResponse>,
}

#[derive(Debug, Serialize)]
pub struct ToolResponsesResult {
    pub resumed: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub cause: Option<String>,
}

/// `POST /v1/queries`. The first round runs in the background; clients read
/// it from `/v1/streams/{query_id}`.
pub async fn submit_query(
    State(state): State<AppState>,
    Json(body): Json<SubmitQueryBody>,
) -> Result<Json<QueryHandle>, ApiError> {
    if body.query.trim().is_empty() {
        return Err(ApiError::BadRequest("query must not be empty".into()));
    }
    let handle = state
        .coordinator
        .start_query(QueryRequest {
            session_id: body.session_id.unwrap_or_default(),
            query: body.query,
            model: body.model,
            switch_reason: body.switch_reason,
        })
        .await?;
    Ok(Json(handle))
}

/// `POST /v1/queries/{query_id}/tool-responses`
pub async fn submit_tool_responses(
    State(state): State<AppState>,
    Path(query_id): Path<QueryId>,
    Json(body): Json<ToolResponsesBody>,
) -> Result<Json<ToolResponsesResult>, ApiError> {
    if body.responses.is_empty() {
        return Err(ApiError::BadRequest("responses must not be empty".into()));
    }
    let resumed = state
        .coordinator
        .submit_tool_responses(&body.session_id, &query_id, body.responses)
        .await?;
    Ok(Json(ToolResponsesResult { resumed }))
}

/// `POST /v1/sessions/{session_id}/cancel`. The body is optional.
pub async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let body: CancelBody = if body.is_empty() {
        CancelBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    state.coordinator.cancel_session(&session_id, body.cause).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}
