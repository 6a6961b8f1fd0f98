use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;

use crate::clients::traits::{InferenceClient, InferenceError, VisionRequest, VisionResponse};
use crate::config::InferenceConfig;

/// Client for an OpenAI-compatible chat completions endpoint with image input
#[derive(Clone, Debug)]
pub struct VisionClient {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
    timeout_ms: u64,
    client: Client,
}

impl VisionClient {
    pub fn new(config: &InferenceConfig) -> Result<Self, InferenceError> {
        if config.model.trim().is_empty() {
            return Err(InferenceError::Config("model name is empty".to_string()));
        }

        // Ensure endpoint has the correct path if not provided
        let endpoint = if config.endpoint.ends_with("/chat/completions") {
            config.endpoint.clone()
        } else {
            format!(
                "{}/v1/chat/completions",
                config.endpoint.trim_end_matches('/')
            )
        };

        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| InferenceError::Transport(format!("failed to build client: {e}")))?;

        Ok(Self {
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_ms: config.timeout_ms,
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_body(&self, request: &VisionRequest) -> Value {
        json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": request.system_prompt},
                {"role": "user", "content": [
                    {"type": "text", "text": request.prompt},
                    {"type": "image_url", "image_url": {
                        "url": format!("data:image/png;base64,{}", request.image_png_base64)
                    }}
                ]}
            ],
            "max_tokens": self.max_tokens,
            "temperature": self.temperature
        })
    }
}

#[async_trait]
impl InferenceClient for VisionClient {
    async fn analyze_image(
        &self,
        request: &VisionRequest,
    ) -> Result<VisionResponse, InferenceError> {
        tracing::debug!(
            "Calling vision model (model={}, image_chars={})",
            self.model,
            request.image_png_base64.len()
        );

        let mut builder = self.client.post(&self.endpoint).json(&self.request_body(request));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let res = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout {
                    timeout_ms: self.timeout_ms,
                }
            } else {
                InferenceError::Transport(e.to_string())
            }
        })?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            let body = res.text().await.unwrap_or_default();
            return Err(InferenceError::Status { status, body });
        }

        let response_json: Value = res
            .json()
            .await
            .map_err(|e| InferenceError::ParseError(e.to_string()))?;

        let model = response_json["model"]
            .as_str()
            .unwrap_or(&self.model)
            .to_string();

        Ok(VisionResponse {
            text: extract_content(&response_json)?,
            model,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Pull the assistant text out of a completion.
/// Handles `choices[0].message.content` as a string or a list of parts, and the
/// converse-style `output.message.content[*].text`.
pub fn extract_content(response: &Value) -> Result<String, InferenceError> {
    let content = if let Some(choice_content) = response.pointer("/choices/0/message/content") {
        match choice_content {
            Value::String(s) => s.clone(),
            Value::Array(parts) => join_text_parts(parts),
            Value::Null => String::new(),
            other => {
                return Err(InferenceError::ParseError(format!(
                    "unexpected content type: {other}"
                )));
            }
        }
    } else if let Some(Value::Array(parts)) = response.pointer("/output/message/content") {
        join_text_parts(parts)
    } else {
        return Err(InferenceError::ParseError(
            "response has neither choices nor output.message".to_string(),
        ));
    };

    let content = content.trim().to_string();
    if content.is_empty() {
        return Err(InferenceError::EmptyResponse);
    }
    Ok(content)
}

fn join_text_parts(parts: &[Value]) -> String {
    parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_openai_string_content() {
        let response = json!({
            "model": "gpt-4o-mini",
            "choices": [{"message": {"role": "assistant", "content": "  {\"cues\": []}  "}}]
        });
        assert_eq!(extract_content(&response).unwrap(), "{\"cues\": []}");
    }

    #[test]
    fn test_extract_part_list_content() {
        let response = json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ]}}]
        });
        assert_eq!(extract_content(&response).unwrap(), "first\nsecond");
    }

    #[test]
    fn test_extract_converse_content() {
        let response = json!({
            "output": {"message": {"role": "assistant", "content": [{"text": "analysis"}]}}
        });
        assert_eq!(extract_content(&response).unwrap(), "analysis");
    }

    #[test]
    fn test_extract_empty_and_malformed() {
        let empty = json!({"choices": [{"message": {"content": "   "}}]});
        assert!(matches!(
            extract_content(&empty),
            Err(InferenceError::EmptyResponse)
        ));

        let malformed = json!({"error": "overloaded"});
        assert!(matches!(
            extract_content(&malformed),
            Err(InferenceError::ParseError(_))
        ));
    }

    #[test]
    fn test_endpoint_path_is_completed() {
        let config = InferenceConfig {
            endpoint: "http://localhost:8111/".to_string(),
            ..InferenceConfig::default()
        };
        let client = VisionClient::new(&config).unwrap();
        assert_eq!(client.endpoint(), "http://localhost:8111/v1/chat/completions");
        assert_eq!(client.model(), "gpt-4o-mini");
    }
}
