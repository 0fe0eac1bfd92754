use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use blockrelay_engine::EngineError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::StreamNotFound(_) => StatusCode::NOT_FOUND,
            Self::Engine(e) => match e {
                EngineError::QueryNotFound(_) | EngineError::StreamExpired { .. } => StatusCode::NOT_FOUND,
                EngineError::UnknownToolUse(_) => StatusCode::BAD_REQUEST,
                EngineError::ToolAlreadyResolved(_) => StatusCode::CONFLICT,
                EngineError::MaxRoundsExceeded(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
