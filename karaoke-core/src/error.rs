//! Boundary error type and the stage-level error taxonomy (§7).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Errors surfaced at the HTTP boundary (C13), modeled on the same
/// shape the teacher uses to map domain errors onto JSON responses.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Common(#[from] karaoke_common::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            ApiError::PayloadTooLarge(msg) => {
                (StatusCode::PAYLOAD_TOO_LARGE, "payload_too_large", msg.clone())
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
            ApiError::Common(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
            }
            ApiError::Other(e) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
            }
        };

        (status, Json(json!({ "error": { "code": code, "message": message } }))).into_response()
    }
}

/// Stage-level error taxonomy (§7): what each kind means, whether it is
/// recovered locally, and the human-facing message it surfaces.
#[derive(Error, Debug, Clone)]
pub enum StageError {
    #[error("Unsupported URL")]
    UnsupportedUrl,
    #[error("Video is unavailable")]
    Unavailable,
    #[error("Video is private")]
    Private,
    #[error("Login required to access this video")]
    LoginRequired,
    #[error("Video is a future live event")]
    FutureLiveEvent,
    #[error("Network error: {0}")]
    Network(String),
    #[error("No results found for '{0}'")]
    NoResults(String),
    #[error("Video unavailable due to a copyright claim")]
    Copyright,
    #[error("Requested format unavailable")]
    FormatUnavailable,
    #[error("{0}")]
    Generic(String),
    #[error("Separation failed: {0}")]
    SeparationFailed(String),
    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),
    #[error("Codec failure: {0}")]
    CodecFailure(String),
    #[error("Cancelled")]
    Cancelled,
}

impl StageError {
    /// The message the orchestrator writes into the terminal progress
    /// event for this failure (§7's "Surfaced to client" column).
    pub fn surface(&self) -> String {
        self.to_string()
    }

    /// Whether the orchestrator should attempt a local fallback instead
    /// of aborting the job (§7's "Recovered locally" column). Lyric
    /// provider failure, empty alignment, and empty subtitle generation
    /// are not expressed as `StageError` at all — those stages return an
    /// empty/partial result that the orchestrator falls back on directly,
    /// so they never reach this method.
    pub fn recoverable(&self) -> bool {
        false
    }
}
