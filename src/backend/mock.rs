//! Mock invoker for testing and dry runs
//!
//! Answers deterministically without touching the network. Tests can script
//! responses, inject failures on specific calls, and hold calls in flight to
//! exercise pause and cancel.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{watch, Semaphore};
use tracing::debug;

use crate::error::InvocationError;

use super::{InvocationRequest, InvocationResponse, InvocationResult, ModelInvoker, ModelOutput};

// ─────────────────────────────────────────────────────────────────
// Mock Configuration
// ─────────────────────────────────────────────────────────────────

/// Configuration for mock behaviour
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Simulated latency per call (ms)
    pub latency_ms: u64,

    /// Fixed response text used once the script is exhausted
    pub fixed_response: Option<String>,

    /// Model-ref prefixes answered with an image instead of text
    pub image_prefixes: Vec<String>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            fixed_response: None,
            image_prefixes: vec!["stable-diffusion".to_string()],
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Mock Invoker
// ─────────────────────────────────────────────────────────────────

/// Mock implementation of ModelInvoker
pub struct MockInvoker {
    config: MockConfig,
    script: Mutex<VecDeque<InvocationResult>>,
    failures: Mutex<HashMap<usize, InvocationError>>,
    calls: RwLock<Vec<InvocationRequest>>,
    call_count: watch::Sender<usize>,
    gate: Option<Arc<Semaphore>>,
}

impl MockInvoker {
    /// Create a mock with default configuration
    pub fn new() -> Self {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Self {
        let (call_count, _) = watch::channel(0);
        Self {
            config,
            script: Mutex::new(VecDeque::new()),
            failures: Mutex::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            call_count,
            gate: None,
        }
    }

    /// Mock whose calls block until [`release`](Self::release) grants them
    pub fn gated() -> Self {
        Self {
            gate: Some(Arc::new(Semaphore::new(0))),
            ..Self::new()
        }
    }

    /// Answer the next calls with these texts, in order
    pub fn with_responses<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.script
            .lock()
            .extend(responses.into_iter().map(|r| Ok(InvocationResponse::text(r))));
        self
    }

    /// Fail the `n`th call (1-based) with `error`
    pub fn fail_on_call(self, n: usize, error: InvocationError) -> Self {
        self.failures.lock().insert(n, error);
        self
    }

    /// Let `n` held calls proceed
    pub fn release(&self, n: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(n);
        }
    }

    /// Number of calls received so far, including ones still in flight
    pub fn call_count(&self) -> usize {
        *self.call_count.borrow()
    }

    /// Wait until at least `n` calls have been received
    pub async fn wait_for_calls(&self, n: usize) {
        let mut rx = self.call_count.subscribe();
        // The sender lives in self, so the channel cannot close while we wait.
        let _ = rx.wait_for(|count| *count >= n).await;
    }

    /// Every request received, in arrival order
    pub fn requests(&self) -> Vec<InvocationRequest> {
        self.calls.read().clone()
    }

    fn default_output(&self, call_no: usize, request: &InvocationRequest) -> ModelOutput {
        if self
            .config
            .image_prefixes
            .iter()
            .any(|p| request.model_ref.starts_with(p.as_str()))
        {
            return ModelOutput::Image {
                mime_type: "image/png".to_string(),
                data: BASE64.encode(request.prompt.as_bytes()),
            };
        }
        if let Some(fixed) = &self.config.fixed_response {
            return ModelOutput::text(fixed.clone());
        }
        let last_line = request.prompt.lines().last().unwrap_or_default();
        ModelOutput::text(format!(
            "[{} #{}] {}",
            request.model_ref, call_no, last_line
        ))
    }
}

impl Default for MockInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelInvoker for MockInvoker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn invoke(&self, request: InvocationRequest) -> InvocationResult {
        let start = Instant::now();
        let call_no = {
            let mut calls = self.calls.write();
            calls.push(request.clone());
            calls.len()
        };
        self.call_count.send_replace(call_no);
        debug!(call_no, model = %request.model_ref, "Mock invocation");

        if let Some(gate) = &self.gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| InvocationError::provider("mock gate closed"))?;
            permit.forget();
        }

        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        if let Some(error) = self.failures.lock().remove(&call_no) {
            return Err(error);
        }

        let scripted = self.script.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(InvocationResponse {
                output: self.default_output(call_no, &request),
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_then_default() {
        let mock = MockInvoker::new().with_responses(["r1", "r2"]);
        let a = mock.invoke(InvocationRequest::new("m", "p", 5)).await.unwrap();
        let b = mock.invoke(InvocationRequest::new("m", "p", 5)).await.unwrap();
        let c = mock.invoke(InvocationRequest::new("m", "hello\nworld", 5)).await.unwrap();

        assert_eq!(a.output, ModelOutput::text("r1"));
        assert_eq!(b.output, ModelOutput::text("r2"));
        assert_eq!(c.output, ModelOutput::text("[m #3] world"));
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fail_on_call() {
        let mock = MockInvoker::new().fail_on_call(2, InvocationError::provider("boom"));
        assert!(mock.invoke(InvocationRequest::new("m", "p", 5)).await.is_ok());
        let err = mock.invoke(InvocationRequest::new("m", "p", 5)).await.unwrap_err();
        assert_eq!(err, InvocationError::provider("boom"));
        assert!(mock.invoke(InvocationRequest::new("m", "p", 5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_image_models() {
        let mock = MockInvoker::new();
        let out = mock
            .invoke(InvocationRequest::new("stable-diffusion:3.5b", "a cat", 5))
            .await
            .unwrap();
        match out.output {
            ModelOutput::Image { mime_type, data } => {
                assert_eq!(mime_type, "image/png");
                assert_eq!(BASE64.decode(data).unwrap(), b"a cat");
            }
            other => panic!("expected image, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_gated_calls_wait_for_release() {
        let mock = Arc::new(MockInvoker::gated());
        let task = {
            let mock = mock.clone();
            tokio::spawn(async move { mock.invoke(InvocationRequest::new("m", "p", 5)).await })
        };

        mock.wait_for_calls(1).await;
        assert!(!task.is_finished());
        mock.release(1);
        assert!(task.await.unwrap().is_ok());
        assert_eq!(mock.requests().len(), 1);
    }
}
