//! Invoker Registry
//!
//! Holds the configured backends and picks one per request by model-ref
//! prefix, so "gpt-4o-txt" can go to a hosted endpoint while "mistral:7b"
//! stays on the local Ollama server.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::BackendSettings;
use crate::error::{Error, InvocationError, Result};

use super::{InvocationRequest, InvocationResult, MockInvoker, ModelInvoker, OpenAiInvoker, SharedInvoker};

// ─────────────────────────────────────────────────────────────────
// Routes
// ─────────────────────────────────────────────────────────────────

/// Send model refs starting with `prefix` to `backend`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    pub backend: String,
}

impl Route {
    pub fn new(prefix: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            backend: backend.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Invoker Registry
// ─────────────────────────────────────────────────────────────────

/// Registry of named invokers with prefix routing
pub struct InvokerRegistry {
    invokers: RwLock<HashMap<String, SharedInvoker>>,
    routes: Vec<Route>,
    default_backend: String,
}

impl InvokerRegistry {
    /// Create an empty registry; unmatched model refs go to `default_backend`
    pub fn new(default_backend: impl Into<String>) -> Self {
        Self {
            invokers: RwLock::new(HashMap::new()),
            routes: Vec::new(),
            default_backend: default_backend.into(),
        }
    }

    /// Build the configured HTTP backends and routes
    pub fn from_settings(settings: &BackendSettings) -> Result<Self> {
        let mut registry = Self::new(settings.default.clone());
        registry.register(Arc::new(OpenAiInvoker::new("openai", settings.openai.clone())?));
        registry.register(Arc::new(OpenAiInvoker::new("ollama", settings.ollama.clone())?));
        for route in &settings.routes {
            registry = registry.with_route(route.prefix.clone(), route.backend.clone());
        }
        if !registry.contains(&registry.default_backend) {
            return Err(Error::Config(format!(
                "Unknown default backend '{}'",
                registry.default_backend
            )));
        }
        info!(
            default = %registry.default_backend,
            routes = registry.routes.len(),
            "Invoker registry ready"
        );
        Ok(registry)
    }

    /// Registry that answers everything with a mock invoker
    pub fn mock() -> Self {
        let registry = Self::new("mock");
        registry.register(Arc::new(MockInvoker::new()));
        registry
    }

    /// Add a route; longer prefixes win over shorter ones
    pub fn with_route(mut self, prefix: impl Into<String>, backend: impl Into<String>) -> Self {
        self.routes.push(Route::new(prefix, backend));
        self.routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        self
    }

    /// Register an invoker under its own name, replacing any previous one
    pub fn register(&self, invoker: SharedInvoker) {
        let name = invoker.name().to_string();
        debug!(backend = %name, "Invoker registered");
        self.invokers.write().insert(name, invoker);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.invokers.read().contains_key(name)
    }

    /// Name of the backend that serves `model_ref`
    pub fn backend_for(&self, model_ref: &str) -> &str {
        self.routes
            .iter()
            .find(|r| model_ref.starts_with(r.prefix.as_str()))
            .map(|r| r.backend.as_str())
            .unwrap_or(&self.default_backend)
    }

    /// Invoker that serves `model_ref`, if it is registered
    pub fn resolve(&self, model_ref: &str) -> Option<SharedInvoker> {
        self.invokers.read().get(self.backend_for(model_ref)).cloned()
    }
}

#[async_trait]
impl ModelInvoker for InvokerRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    async fn invoke(&self, request: InvocationRequest) -> InvocationResult {
        let invoker = self.resolve(&request.model_ref).ok_or_else(|| InvocationError::Unsupported {
            model_ref: request.model_ref.clone(),
        })?;
        debug!(model = %request.model_ref, backend = %invoker.name(), "Routing invocation");
        invoker.invoke(request).await
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ModelOutput;

    struct Named(&'static str);

    #[async_trait]
    impl ModelInvoker for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn invoke(&self, _request: InvocationRequest) -> InvocationResult {
            Ok(crate::backend::InvocationResponse::text(self.0))
        }
    }

    fn registry() -> InvokerRegistry {
        let registry = InvokerRegistry::new("ollama")
            .with_route("gpt-", "openai")
            .with_route("gpt-4o-img", "images");
        registry.register(Arc::new(Named("ollama")));
        registry.register(Arc::new(Named("openai")));
        registry.register(Arc::new(Named("images")));
        registry
    }

    #[test]
    fn test_prefix_routing() {
        let registry = registry();
        assert_eq!(registry.backend_for("gpt-4o-txt"), "openai");
        assert_eq!(registry.backend_for("gpt-4o-img"), "images");
        assert_eq!(registry.backend_for("mistral:7b"), "ollama");
        assert!(registry.contains("images"));
    }

    #[tokio::test]
    async fn test_invoke_routes() {
        let registry = registry();
        let out = registry
            .invoke(InvocationRequest::new("gpt-4o-code", "p", 5))
            .await
            .unwrap();
        assert_eq!(out.output, ModelOutput::text("openai"));
    }

    #[tokio::test]
    async fn test_unregistered_backend_is_unsupported() {
        let registry = InvokerRegistry::new("nowhere");
        let err = registry
            .invoke(InvocationRequest::new("llama3", "p", 5))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            InvocationError::Unsupported {
                model_ref: "llama3".into()
            }
        );
    }

    #[test]
    fn test_from_settings() {
        let registry = InvokerRegistry::from_settings(&BackendSettings::default()).unwrap();
        assert!(registry.contains("ollama") && registry.contains("openai"));
        assert!(!registry.contains("mock"));
        assert_eq!(registry.backend_for("gpt-4o-txt"), "openai");
        assert_eq!(registry.backend_for("llama3.2:3b"), "ollama");

        let bad = BackendSettings {
            default: "cuda".into(),
            ..Default::default()
        };
        assert!(InvokerRegistry::from_settings(&bad).is_err());
    }

    #[test]
    fn test_mock_registry() {
        let registry = InvokerRegistry::mock();
        assert!(registry.contains("mock"));
        assert!(registry.resolve("anything").is_some());
    }
}
