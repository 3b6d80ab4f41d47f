//! Model invocation trait definitions
//!
//! Defines the `ModelInvoker` trait every backend implements, and the
//! request/response types that cross it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InvocationError;
use crate::schema::AttachmentRef;

// ─────────────────────────────────────────────────────────────────
// Request & Response
// ─────────────────────────────────────────────────────────────────

/// One call to a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    /// Model to run (e.g. "mistral:7b", "gpt-4o-txt")
    pub model_ref: String,

    /// Full prompt: persona definition followed by the step text
    pub prompt: String,

    /// Persona creativity, 1 to 10
    pub creativity: u8,

    /// Opaque attachment passed through to the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_ref: Option<AttachmentRef>,
}

impl InvocationRequest {
    pub fn new(model_ref: impl Into<String>, prompt: impl Into<String>, creativity: u8) -> Self {
        Self {
            model_ref: model_ref.into(),
            prompt: prompt.into(),
            creativity,
            attachment_ref: None,
        }
    }

    /// Sampling temperature for OpenAI-style APIs: creativity / 10.
    pub fn temperature(&self) -> f32 {
        f32::from(self.creativity.clamp(1, 10)) / 10.0
    }
}

/// What a model produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ModelOutput {
    Text {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    Image {
        mime_type: String,
        /// Base64-encoded image bytes
        data: String,
    },
}

impl ModelOutput {
    pub fn text(text: impl Into<String>) -> Self {
        ModelOutput::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ModelOutput::Text { text } => Some(text),
            ModelOutput::Image { .. } => None,
        }
    }
}

impl fmt::Display for ModelOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelOutput::Text { text } => f.write_str(text),
            ModelOutput::Image { mime_type, data } => {
                write!(f, "[image {} ({} base64 chars)]", mime_type, data.len())
            }
        }
    }
}

/// Successful invocation result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub output: ModelOutput,

    /// Wall-clock time spent in the backend (ms)
    #[serde(default)]
    pub elapsed_ms: u64,
}

impl InvocationResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            output: ModelOutput::text(text),
            elapsed_ms: 0,
        }
    }
}

pub type InvocationResult = std::result::Result<InvocationResponse, InvocationError>;

// ─────────────────────────────────────────────────────────────────
// ModelInvoker Trait
// ─────────────────────────────────────────────────────────────────

/// A backend able to run a prompt against a model.
///
/// Implementations must be object-safe and shareable across threads; the
/// engine holds them as `Arc<dyn ModelInvoker>`.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Backend name (e.g. "openai", "ollama", "mock")
    fn name(&self) -> &str;

    /// Run one request. Errors are returned, never retried by the caller.
    async fn invoke(&self, request: InvocationRequest) -> InvocationResult;
}

/// Shared invoker reference
pub type SharedInvoker = Arc<dyn ModelInvoker>;
