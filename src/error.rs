use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::generation::GenerationError;
use crate::reference_image::ReferenceImageError;

pub const PROMPT_REQUIRED: &str = "Prompt is required";
pub const DAILY_LIMIT_REACHED: &str = "Daily limit reached. Please come back tomorrow!";

#[derive(Debug, Error)]
pub enum AppError {
    #[error("prompt is required")]
    PromptRequired,

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error("daily quota exhausted")]
    QuotaExceeded,

    #[error(transparent)]
    ReferenceImage(#[from] ReferenceImageError),

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::PromptRequired | Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ReferenceImage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Generation(GenerationError::Upstream { status, .. }) => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Generation(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        let (error, details) = match self {
            Self::PromptRequired => (PROMPT_REQUIRED, None),
            Self::InvalidBody(reason) => {
                ("Invalid request body", Some(Value::String(reason.clone())))
            }
            Self::QuotaExceeded => (DAILY_LIMIT_REACHED, None),
            Self::ReferenceImage(ReferenceImageError::NotFound(_)) => (
                "Server configuration error: reference image not found",
                None,
            ),
            Self::ReferenceImage(ReferenceImageError::Io { .. }) => (
                "Server configuration error: reference image unreadable",
                None,
            ),
            Self::Generation(GenerationError::Upstream { body, .. }) => (
                "Generation service rejected the request",
                Some(upstream_details(body)),
            ),
            Self::Generation(GenerationError::Failed(detail)) => {
                ("Generation failed", Some(detail.clone()))
            }
            Self::Generation(err) => ("Generation failed", Some(Value::String(err.to_string()))),
        };
        ErrorBody {
            error: error.to_string(),
            details,
        }
    }
}

/// Upstream bodies are usually JSON; fall back to the raw text.
fn upstream_details(body: &str) -> Value {
    serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string()))
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() || matches!(self, Self::Generation(_)) {
            tracing::error!(status = status.as_u16(), error = %self, "request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}
