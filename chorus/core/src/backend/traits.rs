//! LLM Backend Traits
//!
//! Trait definitions for the inference server the aggregator fans out to.
//! Keeping the HTTP client behind [`LlmBackend`] lets the aggregator run
//! against Ollama in production and a scripted backend in tests.
//!
//! # Design Philosophy
//!
//! The `LlmBackend` trait provides a common interface for:
//! - Streaming a completion as a sequence of [`Fragment`]s
//! - Non-streaming completions
//! - Health checking the backend
//! - Listing available models

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BackendError;

/// One decoded unit of a model's streaming response.
///
/// Each variant keeps the upstream JSON object it was decoded from so a
/// passthrough relay can forward it untouched.
#[derive(Clone, Debug, PartialEq)]
pub enum Fragment {
    /// A piece of generated text
    Chunk {
        /// The text carried by this line
        text: String,
        /// The upstream line as received
        raw: Value,
    },
    /// End of this model's generation (may carry final metadata)
    Done {
        /// The upstream line as received
        raw: Value,
    },
    /// A decode failure, an upstream error object, or an unrecognised line
    Error(Value),
}

impl Fragment {
    /// Classify one decoded upstream JSON object.
    ///
    /// `done: true` wins over everything else, so the final Ollama line
    /// (which also carries an empty `response`) becomes a single `Done`.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        if value.get("done").and_then(Value::as_bool).unwrap_or(false) {
            return Self::Done { raw: value };
        }

        if let Some(text) = value.get("response").and_then(Value::as_str) {
            return Self::Chunk {
                text: text.to_string(),
                raw: value,
            };
        }

        Self::Error(value)
    }

    /// Decode one NDJSON line. Malformed JSON becomes an error fragment.
    #[must_use]
    pub fn decode_line(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => Self::from_value(value),
            Err(e) => Self::Error(BackendError::Decode(e.to_string()).to_payload()),
        }
    }

    /// Text this fragment contributes to the model's output, if any.
    ///
    /// For `Done` this is the trailing `response` piece, which Ollama leaves
    /// empty in practice but other servers may fill.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Chunk { text, .. } => Some(text),
            Self::Done { raw } => raw
                .get("response")
                .and_then(Value::as_str)
                .filter(|t| !t.is_empty()),
            Self::Error(_) => None,
        }
    }

    /// The upstream JSON behind this fragment
    #[must_use]
    pub fn raw(&self) -> &Value {
        match self {
            Self::Chunk { raw, .. } | Self::Done { raw } | Self::Error(raw) => raw,
        }
    }

    /// Whether this fragment ends the model's generation
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// Lazy, finite sequence of fragments for one streaming completion.
///
/// Never yields an `Err`: transport and decode failures arrive as a
/// [`Fragment::Error`], after which the stream may end.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Fragment> + Send>>;

/// A single completion request
#[derive(Clone, Debug)]
pub struct LlmRequest {
    /// The prompt to send
    pub prompt: String,
    /// Model to use (backend-specific identifier)
    pub model: String,
    /// Whether to stream the response
    pub stream: bool,
}

impl LlmRequest {
    /// Create a new streaming request with prompt and model
    pub fn new(prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.into(),
            stream: true,
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// JSON body for the upstream generate endpoint
    #[must_use]
    pub fn body(&self) -> Value {
        serde_json::json!({
            "model": self.model,
            "prompt": self.prompt,
            "stream": self.stream,
        })
    }
}

/// Response from a non-streaming completion
#[derive(Clone, Debug)]
pub struct Completion {
    /// Model that generated the response
    pub model: String,
    /// The response text
    pub content: String,
    /// Tokens evaluated (if reported)
    pub eval_count: Option<u64>,
    /// Wall-clock time spent waiting for the response
    pub elapsed: Duration,
}

/// A model as described by the inference server.
///
/// Only `name` is interpreted; every other field is carried through so the
/// descriptor list can be handed back to clients verbatim.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Model identifier
    pub name: String,
    /// All remaining upstream fields
    #[serde(flatten)]
    pub details: serde_json::Map<String, Value>,
}

impl ModelDescriptor {
    /// Model size in bytes (if reported)
    #[must_use]
    pub fn size(&self) -> Option<u64> {
        self.details.get("size").and_then(Value::as_u64)
    }

    /// Parameter count label such as `"7B"` (if reported)
    #[must_use]
    pub fn parameter_size(&self) -> Option<&str> {
        self.details
            .get("details")
            .and_then(|d| d.get("parameter_size"))
            .and_then(Value::as_str)
    }
}

/// LLM Backend trait
///
/// Implement this trait to put a different inference server behind the
/// aggregator.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Get the backend name (e.g., "Ollama")
    fn name(&self) -> &str;

    /// Check if the backend is healthy and reachable
    async fn health_check(&self) -> bool;

    /// Start a streaming completion.
    ///
    /// Fails only if the request could not be started (connection refused,
    /// non-success status). Once a stream is returned, every later failure
    /// is delivered in-band as a [`Fragment::Error`].
    async fn stream_completion(&self, request: &LlmRequest)
        -> Result<FragmentStream, BackendError>;

    /// Send a request and wait for the complete response (non-streaming)
    async fn generate(&self, request: &LlmRequest) -> Result<Completion, BackendError>;

    /// List available models
    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, BackendError>;

    /// Check if a specific model is available
    async fn has_model(&self, model: &str) -> Result<bool, BackendError> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| m.name == model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_llm_request_builder() {
        let request = LlmRequest::new("Hello", "llama2").with_stream(false);

        assert_eq!(request.prompt, "Hello");
        assert_eq!(request.model, "llama2");
        assert!(!request.stream);
        assert_eq!(
            request.body(),
            json!({"model": "llama2", "prompt": "Hello", "stream": false})
        );
    }

    #[test]
    fn test_classify_chunk() {
        let fragment = Fragment::from_value(json!({"response": "He", "done": false}));
        assert_eq!(fragment.text(), Some("He"));
        assert!(!fragment.is_done());
    }

    #[test]
    fn test_classify_final_line_is_done() {
        let raw = json!({"model": "a", "response": "", "done": true, "eval_count": 12});
        let fragment = Fragment::from_value(raw.clone());
        assert_eq!(fragment, Fragment::Done { raw });
        assert_eq!(fragment.text(), None);
    }

    #[test]
    fn test_done_keeps_trailing_text() {
        let fragment = Fragment::from_value(json!({"response": "!", "done": true}));
        assert!(fragment.is_done());
        assert_eq!(fragment.text(), Some("!"));
    }

    #[test]
    fn test_classify_upstream_error() {
        let raw = json!({"error": "model 'x' not found"});
        assert_eq!(Fragment::from_value(raw.clone()), Fragment::Error(raw));
    }

    #[test]
    fn test_decode_malformed_line() {
        let fragment = Fragment::decode_line("{\"response\": ");
        match fragment {
            Fragment::Error(payload) => {
                let message = payload["error"].as_str().unwrap();
                assert!(message.starts_with("failed to decode upstream response"));
            }
            other => panic!("expected error fragment, got {other:?}"),
        }
    }

    #[test]
    fn test_model_descriptor_round_trips_unknown_fields() {
        let raw = json!({
            "name": "llama3.2:latest",
            "size": 2019393189u64,
            "digest": "a80c4f17acd5",
            "details": {"parameter_size": "3.2B", "family": "llama"}
        });

        let descriptor: ModelDescriptor = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(descriptor.name, "llama3.2:latest");
        assert_eq!(descriptor.size(), Some(2_019_393_189));
        assert_eq!(descriptor.parameter_size(), Some("3.2B"));
        assert_eq!(serde_json::to_value(&descriptor).unwrap(), raw);
    }

    #[test]
    fn test_model_descriptor_serializes_in_upstream_order() {
        let upstream = r#"{"name":"llama3.2:latest","modified_at":"2024-10-01T12:00:00Z","size":2019393189,"digest":"a80c4f17acd5"}"#;
        let descriptor: ModelDescriptor = serde_json::from_str(upstream).unwrap();
        assert_eq!(descriptor.size(), Some(2_019_393_189));
        assert_eq!(serde_json::to_string(&descriptor).unwrap(), upstream);
    }
}
