use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stage-specific request sent to the vision model
#[derive(Debug, Clone, Serialize)]
pub struct VisionRequest {
    pub system_prompt: String,
    pub prompt: String,
    pub image_png_base64: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisionResponse {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("parse error: {0}")]
    ParseError(String),
    #[error("model returned no content")]
    EmptyResponse,
    #[error("invalid client configuration: {0}")]
    Config(String),
}

/// External inference capability used by the visual analysis stage
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn analyze_image(&self, request: &VisionRequest) -> Result<VisionResponse, InferenceError>;

    fn model(&self) -> &str;
}
