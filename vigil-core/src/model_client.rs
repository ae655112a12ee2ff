//! Model service client: text in, text out.
//!
//! Provides a `ModelBackend` trait with one HTTP implementation:
//! - **OpenAI Responses**: `POST {base_url}/responses` with bearer auth
//!
//! The fallback extractor and the translation batcher both talk to the model
//! through this trait, so tests substitute in-process mocks.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use std::sync::Arc;

use crate::config::{ModelConfig, VigilConfig};

// ============================================================================
// ModelBackend trait
// ============================================================================

/// Abstraction over completion providers.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Send `prompt` and return the raw text output.
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Response contained no output text")]
    EmptyOutput,

    #[error("Missing API key")]
    MissingApiKey,

    #[error("All {attempts} retry attempts failed")]
    RetryExhausted { attempts: usize },
}

impl ModelError {
    /// Rate limits, server errors and transport failures are retried;
    /// other API errors are answers about this particular request.
    pub fn is_transient(&self) -> bool {
        match self {
            ModelError::Http(_) => true,
            ModelError::Api { code, .. } => *code == 429 || *code >= 500,
            _ => false,
        }
    }

    /// No later request in the same step can succeed either.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            ModelError::Http(_) | ModelError::MissingApiKey | ModelError::RetryExhausted { .. }
        )
    }
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone)]
pub struct ModelClientConfig {
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl ModelClientConfig {
    /// Builds client config from the `[model]` section; the key falls back to
    /// `OPENAI_API_KEY`.
    pub fn new(api_key: Option<String>, model: &ModelConfig) -> Self {
        let api_key = api_key
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_default();

        Self {
            api_key,
            model: model.model.clone(),
            timeout: Duration::from_secs(model.timeout_seconds),
            max_retries: model.max_retries,
            retry_delay_ms: model.retry_delay_ms,
        }
    }
}

// ============================================================================
// Responses API structs (private)
// ============================================================================

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResponsesBody {
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: Option<ApiErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

impl ResponsesBody {
    fn into_text(self) -> Option<String> {
        if let Some(text) = self.output_text.filter(|t| !t.trim().is_empty()) {
            return Some(text);
        }
        let joined: Vec<String> = self
            .output
            .into_iter()
            .flat_map(|item| item.content)
            .filter(|c| c.kind == "output_text")
            .filter_map(|c| c.text)
            .collect();
        if joined.is_empty() {
            None
        } else {
            Some(joined.join("\n"))
        }
    }
}

// ============================================================================
// OpenAiResponsesClient
// ============================================================================

#[derive(Debug, Clone)]
pub struct OpenAiResponsesClient {
    client: Client,
    config: ModelClientConfig,
    base_url: String,
}

impl OpenAiResponsesClient {
    pub fn new(config: ModelClientConfig, base_url: String) -> Result<Self, ModelError> {
        if config.api_key.is_empty() {
            return Err(ModelError::MissingApiKey);
        }

        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            config,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn complete_once(&self, prompt: &str) -> Result<String, ModelError> {
        let url = format!("{}/responses", self.base_url);
        let request = ResponsesRequest {
            model: &self.config.model,
            input: prompt,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorResponse>(&error_body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .unwrap_or(error_body);

            tracing::error!(code = status.as_u16(), message = %message, "Model API error");

            return Err(ModelError::Api {
                code: status.as_u16(),
                message,
            });
        }

        let body: ResponsesBody = response.json().await?;
        body.into_text().ok_or(ModelError::EmptyOutput)
    }
}

#[async_trait]
impl ModelBackend for OpenAiResponsesClient {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let retry_strategy = ExponentialBackoff::from_millis(self.config.retry_delay_ms)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.config.max_retries);

        let result = RetryIf::spawn(
            retry_strategy,
            || self.complete_once(prompt),
            |e: &ModelError| e.is_transient(),
        )
        .await;

        match result {
            Ok(text) => Ok(text),
            Err(e) if !e.is_transient() => Err(e),
            Err(e) => {
                tracing::error!(
                    attempts = self.config.max_retries,
                    error = %e,
                    "All model retry attempts failed"
                );
                Err(ModelError::RetryExhausted {
                    attempts: self.config.max_retries,
                })
            }
        }
    }

    fn name(&self) -> &str {
        "openai-responses"
    }
}

/// Builds the configured backend, or `None` when no API key is available.
/// Callers treat `None` as "skip the model-backed steps".
pub fn create_backend(config: &VigilConfig) -> Option<Arc<dyn ModelBackend>> {
    let client_config = ModelClientConfig::new(None, &config.model);
    match OpenAiResponsesClient::new(client_config, config.model.base_url.clone()) {
        Ok(client) => {
            tracing::info!(model = %config.model.model, "Model backend configured");
            Some(Arc::new(client))
        }
        Err(ModelError::MissingApiKey) => {
            tracing::warn!("OPENAI_API_KEY not set, fallback enrichment and translation disabled");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to build model client, model-backed steps disabled");
            None
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
