//! Error responses.
//!
//! Clients only ever see a status and a short message; the underlying error
//! is logged here and never serialized.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use crate::orchestrator::OrchestratorError;

/// Generic message for internal failures.
pub const INTERNAL_MESSAGE: &str = "something went wrong. try again.";

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn internal(message: &str) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.to_string(),
        }
    }

    /// Map an orchestrator error, using `internal_message` for 5xx.
    pub fn from_orchestrator(err: OrchestratorError, internal_message: &str) -> Self {
        match err {
            OrchestratorError::Validation(e) => Self::bad_request(e.to_string()),
            OrchestratorError::NotFound(_) => Self {
                status: StatusCode::NOT_FOUND,
                message: err.to_string(),
            },
            OrchestratorError::Conflict { .. } => {
                warn!(error = %err, "request conflicts with load test state");
                Self {
                    status: StatusCode::CONFLICT,
                    message: err.to_string(),
                }
            }
            OrchestratorError::Remote(ref e) => {
                let output = e.output().map(|o| o.combined()).unwrap_or_default();
                error!(error = %err, %output, "remote operation failed");
                Self::internal(internal_message)
            }
            other => {
                error!(error = %other, "request failed");
                Self::internal(internal_message)
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self::from_orchestrator(err, INTERNAL_MESSAGE)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = if self.status == StatusCode::BAD_REQUEST {
            json!({ "status": "bad request", "message": self.message })
        } else {
            json!({ "message": self.message })
        };
        (self.status, Json(body)).into_response()
    }
}
