use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::imaging::ImageLimits;
use crate::pipeline::StagePolicy;

const MAX_STAGE_RETRIES: u32 = 5;

/// Main configuration structure loaded from productivity_pipeline.toml and environment variables
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Runtime configuration loaded from environment variables
    #[serde(skip)]
    pub runtime: RuntimeConfig,
}

/// Connection settings for the vision inference endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// OpenAI-compatible chat completions URL
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8111/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_ms: 120_000,
            max_tokens: 800,
            temperature: 0.1,
        }
    }
}

/// Orchestration and stage behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Name embedded in execution ARNs
    pub state_machine: String,
    pub stage_timeout_ms: u64,
    /// Extra attempts per stage; 0 disables retry
    pub stage_retries: u32,
    pub retry_backoff_ms: u64,
    /// Limit on the base64-encoded screenshot
    pub max_image_bytes: usize,
    /// Screenshots larger than this on either side are downscaled
    pub max_image_dimension: u32,
    /// Byte budget for the PNG sent to inference
    pub target_image_bytes: usize,
    /// Finished executions kept for describe/list; the oldest are evicted first
    pub max_retained_executions: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            state_machine: "ProductivityAnalysisWorkflow".to_string(),
            stage_timeout_ms: 300_000,
            stage_retries: 0,
            retry_backoff_ms: 500,
            max_image_bytes: 262_144,
            max_image_dimension: 500,
            target_image_bytes: 250_000,
            max_retained_executions: 1_000,
        }
    }
}

/// Runtime configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub log_level: String,
    pub http_bind: std::net::SocketAddr,
    pub http_path: String,
    pub bearer_token: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: "productivity_pipeline=info,tower_http=info".to_string(),
            http_bind: std::net::SocketAddr::from(([127, 0, 0, 1], 8787)),
            http_path: "/track".to_string(),
            bearer_token: None,
        }
    }
}

impl Config {
    /// Load configuration from TOML file and environment variables
    /// Uses PIPELINE_CONFIG environment variable or defaults to "productivity_pipeline.toml"
    pub fn load() -> anyhow::Result<Self> {
        load_env_file();

        let config_path = std::env::var("PIPELINE_CONFIG")
            .unwrap_or_else(|_| "productivity_pipeline.toml".to_string());

        let mut config: Config = if let Ok(content) = std::fs::read_to_string(&config_path) {
            toml::from_str(&content)?
        } else {
            tracing::warn!("Config file {} not found, using defaults", config_path);
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.runtime = RuntimeConfig::load_from(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Apply `PIPE_*` overrides on top of file values (env-first)
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            let raw = lookup(key)?;
            match raw.trim().parse::<T>() {
                Ok(v) => {
                    tracing::debug!("{key} env override applied");
                    Some(v)
                }
                Err(_) => {
                    tracing::warn!("Ignoring unparseable {key}='{raw}'");
                    None
                }
            }
        }

        if let Some(endpoint) = lookup("PIPE_INFERENCE_ENDPOINT") {
            self.inference.endpoint = endpoint;
        }
        if let Some(model) = lookup("PIPE_INFERENCE_MODEL") {
            self.inference.model = model;
        }
        if let Some(key) = lookup("PIPE_INFERENCE_API_KEY").or_else(|| lookup("OPENAI_API_KEY")) {
            self.inference.api_key = Some(key);
        }
        if let Some(v) = parsed(&lookup, "PIPE_INFERENCE_TIMEOUT_MS") {
            self.inference.timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "PIPE_INFERENCE_MAX_TOKENS") {
            self.inference.max_tokens = v;
        }
        if let Some(v) = parsed(&lookup, "PIPE_STAGE_TIMEOUT_MS") {
            self.pipeline.stage_timeout_ms = v;
        }
        if let Some(v) = parsed(&lookup, "PIPE_STAGE_RETRIES") {
            self.pipeline.stage_retries = v;
        }
        if let Some(v) = parsed(&lookup, "PIPE_RETRY_BACKOFF_MS") {
            self.pipeline.retry_backoff_ms = v;
        }
        if let Some(v) = parsed(&lookup, "PIPE_MAX_IMAGE_BYTES") {
            self.pipeline.max_image_bytes = v;
        }
        if let Some(v) = parsed(&lookup, "PIPE_MAX_IMAGE_DIMENSION") {
            self.pipeline.max_image_dimension = v;
        }
        if let Some(v) = parsed(&lookup, "PIPE_TARGET_IMAGE_BYTES") {
            self.pipeline.target_image_bytes = v;
        }
        if let Some(v) = parsed(&lookup, "PIPE_MAX_RETAINED_EXECUTIONS") {
            self.pipeline.max_retained_executions = v;
        }
    }

    /// Reject unusable values and clamp the rest
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.pipeline.stage_timeout_ms == 0 {
            anyhow::bail!("stage_timeout_ms must be greater than 0");
        }
        if self.pipeline.max_image_bytes == 0 {
            anyhow::bail!("max_image_bytes must be greater than 0");
        }
        if self.pipeline.max_image_dimension < 16 {
            anyhow::bail!("max_image_dimension must be at least 16");
        }
        if self.pipeline.target_image_bytes == 0 {
            anyhow::bail!("target_image_bytes must be greater than 0");
        }
        if self.pipeline.max_retained_executions == 0 {
            anyhow::bail!("max_retained_executions must be greater than 0");
        }
        if self.pipeline.stage_retries > MAX_STAGE_RETRIES {
            tracing::warn!(
                "stage_retries {} exceeds max {}, clamping",
                self.pipeline.stage_retries,
                MAX_STAGE_RETRIES
            );
            self.pipeline.stage_retries = MAX_STAGE_RETRIES;
        }
        if !self.inference.endpoint.starts_with("http://")
            && !self.inference.endpoint.starts_with("https://")
        {
            anyhow::bail!(
                "Inference endpoint '{}' must start with http:// or https://",
                self.inference.endpoint
            );
        }
        if !(0.0..=2.0).contains(&self.inference.temperature) {
            anyhow::bail!("inference temperature must be between 0.0 and 2.0");
        }
        if !self.runtime.http_path.starts_with('/') {
            anyhow::bail!("PIPE_HTTP_PATH must start with '/'");
        }
        Ok(())
    }

    /// Convenience: per-stage timeout and retry settings
    pub fn stage_policy(&self) -> StagePolicy {
        StagePolicy {
            timeout: Duration::from_millis(self.pipeline.stage_timeout_ms),
            retries: self.pipeline.stage_retries,
            backoff: Duration::from_millis(self.pipeline.retry_backoff_ms),
        }
    }

    pub fn image_limits(&self) -> ImageLimits {
        ImageLimits {
            max_encoded_bytes: self.pipeline.max_image_bytes,
            max_dimension: self.pipeline.max_image_dimension,
            target_bytes: self.pipeline.target_image_bytes,
        }
    }
}

/// Load `.env` (or `PIPE_ENV_FILE`) into the process environment; existing
/// variables win. Safe to call more than once.
pub fn load_env_file() {
    if let Ok(env_path) = std::env::var("PIPE_ENV_FILE") {
        let _ = dotenvy::from_path(env_path);
    } else {
        let _ = dotenvy::dotenv();
    }
}

impl RuntimeConfig {
    /// Load runtime configuration from a variable source (the process env in production)
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        if let Some(level) = lookup("RUST_LOG") {
            cfg.log_level = level;
        }
        if let Some(v) = lookup("PIPE_HTTP_BIND")
            && let Ok(bind) = v.parse::<std::net::SocketAddr>()
        {
            cfg.http_bind = bind;
        }
        if let Some(path) = lookup("PIPE_HTTP_PATH") {
            cfg.http_path = path;
        }
        cfg.bearer_token = lookup("PIPE_BEARER_TOKEN")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        cfg
    }
}
