//! JSON shapes of the HTTP surface and the error-to-status mapping

use assessor_core::{AssessorError, DispatchOutcome};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

/// `POST /chat` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatInput {
    pub user_message: String,
    pub api_key: String,
}

/// `POST /chat` query string
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatQuery {
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
}

/// HTTP status for a failed request
pub fn status_for(err: &AssessorError) -> StatusCode {
    match err {
        AssessorError::AuthFailure => StatusCode::UNAUTHORIZED,
        AssessorError::SessionNotFound(_) => StatusCode::NOT_FOUND,
        e if e.is_client_error() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Error payload with its mapped status
pub fn error_response(err: &AssessorError) -> Response {
    (status_for(err), Json(DispatchOutcome::error_payload(err))).into_response()
}
