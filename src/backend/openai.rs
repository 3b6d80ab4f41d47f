//! OpenAI-compatible API invoker
//!
//! Implements ModelInvoker by making HTTP calls to any OpenAI-compatible
//! endpoint (OpenAI, Ollama's `/v1`, vLLM, LM Studio, etc.). Text models go
//! through chat completions; image models through image generations with a
//! base64 payload.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, InvocationError, Result};

use super::{InvocationRequest, InvocationResponse, InvocationResult, ModelInvoker, ModelOutput};

// ─────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for an OpenAI-compatible endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// API base URL (e.g., "https://api.openai.com/v1", "http://localhost:11434/v1")
    pub base_url: String,

    /// API key (empty string for local servers like Ollama)
    pub api_key: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum retries on transient errors
    pub max_retries: u32,

    /// Model-ref prefixes served by the image generation endpoint
    pub image_prefixes: Vec<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434/v1".to_string(),
            api_key: String::new(),
            timeout_secs: 120,
            max_retries: 2,
            image_prefixes: Vec::new(),
        }
    }
}

impl OpenAiConfig {
    /// Hosted OpenAI defaults
    pub fn openai() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            image_prefixes: vec!["gpt-4o-img".to_string(), "dall-e".to_string()],
            ..Self::default()
        }
    }

    /// Local Ollama defaults
    pub fn ollama() -> Self {
        Self::default()
    }
}

// ─────────────────────────────────────────────────────────────────
// OpenAI API types (request/response)
// ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct ImageGenerationRequest {
    model: String,
    prompt: String,
    n: u32,
    response_format: String,
}

#[derive(Debug, Deserialize)]
struct ImageGenerationResponse {
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    b64_json: Option<String>,
}

// ─────────────────────────────────────────────────────────────────
// OpenAI Invoker
// ─────────────────────────────────────────────────────────────────

/// OpenAI-compatible API invoker
pub struct OpenAiInvoker {
    name: String,
    config: OpenAiConfig,
    client: Client,
}

impl OpenAiInvoker {
    /// Create an invoker registered under `name`
    pub fn new(name: impl Into<String>, config: OpenAiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;
        let name = name.into();

        info!(
            backend = %name,
            base_url = %config.base_url,
            "OpenAI-compatible invoker created"
        );

        Ok(Self {
            name,
            config,
            client,
        })
    }

    /// Build the authorization header value (if API key is set)
    fn auth_header(&self) -> Option<String> {
        if self.config.api_key.is_empty() {
            None
        } else {
            Some(format!("Bearer {}", self.config.api_key))
        }
    }

    fn is_image_model(&self, model_ref: &str) -> bool {
        self.config
            .image_prefixes
            .iter()
            .any(|p| model_ref.starts_with(p.as_str()))
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// POST a JSON body with retry on 429, 5xx and connection errors
    async fn post_with_retry<B, R>(&self, path: &str, body: &B) -> std::result::Result<R, InvocationError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Send,
    {
        let url = self.endpoint(path);
        let mut last_error: Option<InvocationError> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_millis(500 * 2u64.pow(attempt - 1));
                debug!(attempt, ?backoff, "Retrying after error");
                tokio::time::sleep(backoff).await;
            }

            let request = self.authorized(self.client.post(&url).json(body));
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<R>()
                            .await
                            .map_err(|e| InvocationError::malformed(format!("Failed to parse API response: {}", e)));
                    }

                    let body = response.text().await.unwrap_or_default();
                    if is_retryable_status(status) {
                        warn!(status = %status, attempt, "Retryable API error: {}", body);
                        last_error = Some(InvocationError::provider(format!("API error {}: {}", status, body)));
                    } else {
                        return Err(InvocationError::provider(format!("API error {}: {}", status, body)));
                    }
                }
                Err(e) if e.is_timeout() => {
                    warn!(attempt, error = %e, "Request timed out");
                    last_error = Some(InvocationError::Timeout {
                        after_secs: self.config.timeout_secs,
                    });
                }
                Err(e) if e.is_connect() => {
                    warn!(attempt, error = %e, "Retryable connection error");
                    last_error = Some(InvocationError::provider(format!("Connection error: {}", e)));
                }
                Err(e) => {
                    return Err(InvocationError::provider(format!("Request error: {}", e)));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| InvocationError::provider("All retry attempts exhausted")))
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match self.auth_header() {
            Some(auth) => request.header("Authorization", auth),
            None => request,
        }
    }

    async fn chat(&self, request: &InvocationRequest) -> std::result::Result<ModelOutput, InvocationError> {
        let body = ChatCompletionRequest {
            model: request.model_ref.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: request.prompt.clone(),
            }],
            temperature: request.temperature(),
        };
        let parsed: ChatCompletionResponse = self.post_with_retry("chat/completions", &body).await?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InvocationError::malformed("No choices in API response"))?;
        Ok(ModelOutput::text(choice.message.content.unwrap_or_default()))
    }

    async fn image(&self, request: &InvocationRequest) -> std::result::Result<ModelOutput, InvocationError> {
        let body = ImageGenerationRequest {
            model: request.model_ref.clone(),
            prompt: request.prompt.clone(),
            n: 1,
            response_format: "b64_json".to_string(),
        };
        let parsed: ImageGenerationResponse = self.post_with_retry("images/generations", &body).await?;
        let data = parsed
            .data
            .into_iter()
            .find_map(|d| d.b64_json)
            .ok_or_else(|| InvocationError::malformed("No image generated"))?;
        BASE64
            .decode(data.as_bytes())
            .map_err(|e| InvocationError::malformed(format!("Image payload is not base64: {}", e)))?;
        Ok(ModelOutput::Image {
            mime_type: "image/png".to_string(),
            data,
        })
    }
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl ModelInvoker for OpenAiInvoker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(&self, request: InvocationRequest) -> InvocationResult {
        let start = Instant::now();
        let output = if self.is_image_model(&request.model_ref) {
            self.image(&request).await?
        } else {
            self.chat(&request).await?
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(backend = %self.name, model = %request.model_ref, elapsed_ms, "Invocation complete");
        Ok(InvocationResponse { output, elapsed_ms })
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
