//! HTTP gateway for the pipeline
//!
//! Axum-based server with optional bearer authentication. Submissions are
//! acknowledged immediately with an execution ARN; execution status is plain JSON.

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::{Result, ServiceError};
use crate::executions::{ExecutionStore, Submission};
use crate::models::PipelineInput;

/// Shared state for HTTP server
#[derive(Clone)]
pub struct HttpState {
    pub config: Arc<Config>,
    pub executions: ExecutionStore,
}

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    "ok"
}

/// Accept a `PipelineInput` or the `{"input": "<json>"}` envelope
pub fn parse_submission(body: &[u8]) -> Result<PipelineInput> {
    let value: Value = serde_json::from_slice(body)?;
    let value = match value {
        Value::Object(mut map) if map.get("input").is_some_and(Value::is_string) => {
            let inner = map.remove("input").unwrap_or_default();
            let raw = inner.as_str().unwrap_or_default();
            serde_json::from_str(raw).map_err(|e| ServiceError::Validation {
                message: format!("input is not valid JSON: {}", e),
            })?
        }
        Value::Object(map) => Value::Object(map),
        _ => {
            return Err(ServiceError::Validation {
                message: "Request body must be a JSON object".into(),
            });
        }
    };
    serde_json::from_value(value).map_err(|e| ServiceError::Validation {
        message: format!("Invalid parameters: {}", e),
    })
}

/// Submission endpoint
pub async fn track_handler(
    State(state): State<HttpState>,
    body: Bytes,
) -> Result<Json<Submission>> {
    let input = parse_submission(&body)?;
    input.validate(state.config.pipeline.max_image_bytes)?;
    Ok(Json(state.executions.submit(input)))
}

pub async fn describe_handler(
    State(state): State<HttpState>,
    Path(execution_arn): Path<String>,
) -> Result<impl IntoResponse> {
    let record = state
        .executions
        .describe(&execution_arn)
        .ok_or_else(|| ServiceError::NotFound {
            message: format!("Execution not found: {}", execution_arn),
        })?;
    Ok(Json(record))
}

pub async fn list_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let executions = state.executions.list();
    Json(json!({
        "count": executions.len(),
        "executions": executions
    }))
}

pub async fn abort_handler(
    State(state): State<HttpState>,
    Path(execution_arn): Path<String>,
) -> Result<impl IntoResponse> {
    let status = state.executions.abort(&execution_arn)?;
    Ok(Json(json!({
        "executionArn": execution_arn,
        "status": status
    })))
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::CONTENT_TYPE, "application/json")],
        json!({"error": "Unauthorized", "message": "Missing or invalid bearer token"}).to_string(),
    )
        .into_response()
}

/// Build the gateway router
pub fn router(state: HttpState) -> Router {
    let track_path = state.config.runtime.http_path.clone();
    let token = state.config.runtime.bearer_token.clone();

    Router::new()
        .route("/health", get(health_handler))
        .route(track_path.as_str(), post(track_handler))
        .route("/executions", get(list_handler))
        .route(
            "/executions/:arn",
            get(describe_handler).delete(abort_handler),
        )
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        // Bearer auth layer; disabled when no token is configured
        .layer(middleware::from_fn_with_state(
            token,
            |State(token): State<Option<String>>,
             req: axum::http::Request<Body>,
             next: axum::middleware::Next| async move {
                // Allow /health without auth
                if req.uri().path() == "/health" {
                    return next.run(req).await;
                }
                let Some(expected) = token else {
                    return next.run(req).await;
                };
                let headers: &HeaderMap = req.headers();
                let header_ok = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|h| h.to_str().ok())
                    .map(|v| v == format!("Bearer {}", expected))
                    .unwrap_or(false);
                if !header_ok {
                    return unauthorized();
                }
                next.run(req).await
            },
        ))
        .with_state(state)
}

/// Start the HTTP server
pub async fn start_http_server(config: Arc<Config>, executions: ExecutionStore) -> anyhow::Result<()> {
    if config.runtime.bearer_token.is_none() {
        tracing::warn!("PIPE_BEARER_TOKEN not set; the gateway accepts unauthenticated requests");
    }

    let bind = config.runtime.http_bind;
    let path = config.runtime.http_path.clone();
    let app = router(HttpState { config, executions });

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind HTTP listener: {}", e))?;

    tracing::info!("Starting HTTP server on {} (submissions at {})", bind, path);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_body() {
        let input = parse_submission(br#"{"subject":"E1","window":"09:00-10:00","image_data":"x"}"#)
            .unwrap();
        assert_eq!(input.subject, "E1");
        assert_eq!(input.window.as_deref(), Some("09:00-10:00"));
    }

    #[test]
    fn test_parse_envelope_body() {
        let body = json!({"input": "{\"subject\":\"E2\",\"image_data\":\"abc\"}"}).to_string();
        let input = parse_submission(body.as_bytes()).unwrap();
        assert_eq!(input.subject, "E2");
        assert_eq!(input.image_data, "abc");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            parse_submission(b"not json"),
            Err(ServiceError::Validation { .. })
        ));
        assert!(matches!(
            parse_submission(b"[1,2,3]"),
            Err(ServiceError::Validation { .. })
        ));
        assert!(matches!(
            parse_submission(br#"{"input": "{broken"}"#),
            Err(ServiceError::Validation { .. })
        ));
    }
}
