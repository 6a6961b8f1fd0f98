//! Error types for the productivity pipeline

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::models::StageName;

/// Failure raised by a single stage
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StageError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Analysis failed: {message}")]
    Analysis { message: String },

    #[error("Stage timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Run cancelled")]
    Cancelled,
}

impl StageError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        StageError::InvalidInput {
            message: message.into(),
        }
    }

    pub fn analysis(message: impl Into<String>) -> Self {
        StageError::Analysis {
            message: message.into(),
        }
    }

    /// Caller faults and cancellations are never retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Analysis { .. } | StageError::Timeout { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::InvalidInput { .. } => ErrorKind::InvalidInput,
            StageError::Analysis { .. } => ErrorKind::Analysis,
            StageError::Timeout { .. } => ErrorKind::Timeout,
            StageError::Cancelled => ErrorKind::Cancelled,
        }
    }

    fn into_message(self) -> String {
        match self {
            StageError::InvalidInput { message } | StageError::Analysis { message } => message,
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "InvalidInputError")]
    InvalidInput,
    #[serde(rename = "AnalysisError")]
    Analysis,
    #[serde(rename = "TimeoutError")]
    Timeout,
    #[serde(rename = "CancelledError")]
    Cancelled,
}

/// Terminal failure of a run, tagged with the stage that raised it
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{stage} failed: {message}")]
pub struct PipelineError {
    pub stage: StageName,
    pub kind: ErrorKind,
    pub message: String,
}

impl PipelineError {
    pub fn from_stage(stage: StageName, err: StageError) -> Self {
        Self {
            stage,
            kind: err.kind(),
            message: err.into_message(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self.kind {
            ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Service-level error for the gateway, configuration and CLI
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Malformed request bodies are the caller's fault
impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Validation {
            message: format!("Request body is not valid JSON: {}", err),
        }
    }
}

impl From<StageError> for ServiceError {
    fn from(err: StageError) -> Self {
        match err {
            StageError::InvalidInput { message } => ServiceError::Validation { message },
            other => ServiceError::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl ServiceError {
    fn parts(&self) -> (StatusCode, &'static str, &str) {
        match self {
            ServiceError::Config { message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ConfigurationError", message)
            }
            ServiceError::Validation { message } => {
                (StatusCode::BAD_REQUEST, "InvalidInputError", message)
            }
            ServiceError::NotFound { message } => (StatusCode::NOT_FOUND, "NotFound", message),
            ServiceError::Internal { message } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "InternalError", message)
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.parts().0
    }
}

/// Gateway responses carry `{error, message}`
impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, label, message) = self.parts();
        if status.is_server_error() {
            tracing::error!("{label}: {message}");
        }
        (
            status,
            axum::Json(json!({ "error": label, "message": message })),
        )
            .into_response()
    }
}

/// Result type alias for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;
