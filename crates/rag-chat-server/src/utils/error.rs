use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Per-turn error taxonomy for the chat pipeline. Every variant is
/// recovered locally; none aborts the process.
#[derive(Error, Debug)]
pub enum ChatError {
    /// Message was empty after sanitization. No turn is recorded.
    #[error("Invalid message")]
    InvalidMessage,

    /// Admission guard already held for this session. Retryable.
    #[error("Chatbot is processing the previous message")]
    Busy,

    /// The embedding backend could not be reached. Fatal to the turn only.
    #[error("Retrieval failed: {0}")]
    RetrievalFailure(String),

    /// Upstream generation failed or the reply had no extractable answer.
    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    /// A stored record failed to parse even after trimming the dangling
    /// separator. Prior history is unavailable; the session stays usable.
    #[error("Conversation log corrupted: {0}")]
    LogCorruption(String),

    #[error("Knowledge index load failed: {0}")]
    IndexLoadFailure(String),

    /// Turn-log write failure.
    #[error("Storage failure: {0}")]
    Storage(String),
}

/// Why a similarity search failed. The orchestrator degrades integrity
/// failures to an empty retrieval result but treats an unreachable
/// embedding backend as fatal to the turn.
#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("embedding backend unavailable: {0}")]
    Embedding(anyhow::Error),

    #[error("knowledge index integrity: {0}")]
    Integrity(String),
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("LLM error: {0}")]
    LlmError(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match self {
            ApiError::BadRequest(msg) => {
                tracing::warn!("Bad request: {}", msg);
                (StatusCode::BAD_REQUEST, "BadRequest", msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", msg)
            }
            ApiError::LlmError(msg) => {
                tracing::error!("LLM error: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, "LlmError", msg)
            }
        };

        let body = Json(ErrorResponse {
            error: error_type.to_string(),
            message,
        });

        (status, body).into_response()
    }
}
