//! Ollama Backend Implementation
//!
//! LLM backend for Ollama (local LLM server).
//!
//! # Ollama API
//!
//! - `/api/generate` - Generate completions (NDJSON when streaming)
//! - `/api/tags` - List available models
//!
//! Streaming bodies are decoded incrementally by [`LineDecoder`]; the
//! returned [`FragmentStream`] yields each line as soon as its bytes arrive.

use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::ndjson::LineDecoder;
use super::traits::{Completion, Fragment, FragmentStream, LlmBackend, LlmRequest, ModelDescriptor};
use crate::config::BackendConfig;
use crate::error::BackendError;

/// Body of `GET /api/tags`
#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelDescriptor>,
}

/// Ollama backend client
///
/// Cheap to clone; clones share one connection pool.
#[derive(Clone)]
pub struct OllamaBackend {
    /// Server settings
    config: BackendConfig,
    /// HTTP client
    http_client: reqwest::Client,
}

impl OllamaBackend {
    /// Create a backend from explicit settings
    pub fn from_config(config: BackendConfig) -> Result<Self, BackendError> {
        // No overall timeout on the client: a streaming generation may
        // legitimately run for minutes. Non-streaming calls set their own.
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| BackendError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Create a backend for `host:port` with default timeouts
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, BackendError> {
        Self::from_config(BackendConfig::new(host, port))
    }

    /// Settings this backend was built from
    #[must_use]
    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Get the base URL
    fn base_url(&self) -> String {
        self.config.base_url()
    }

    /// Get generate endpoint URL
    fn generate_url(&self) -> String {
        format!("{}/api/generate", self.base_url())
    }

    /// Get tags endpoint URL
    fn tags_url(&self) -> String {
        format!("{}/api/tags", self.base_url())
    }

    /// Turn a non-success response into an error, consuming the body
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(BackendError::from_status(status, &body))
    }
}

#[async_trait]
impl LlmBackend for OllamaBackend {
    fn name(&self) -> &str {
        "Ollama"
    }

    async fn health_check(&self) -> bool {
        match self
            .http_client
            .get(self.tags_url())
            .timeout(self.config.list_timeout())
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "Ollama health check failed");
                false
            }
        }
    }

    async fn stream_completion(
        &self,
        request: &LlmRequest,
    ) -> Result<FragmentStream, BackendError> {
        let body = request.clone().with_stream(true).body();
        let response = self
            .http_client
            .post(self.generate_url())
            .json(&body)
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let model = request.model.clone();
        let mut bytes = response.bytes_stream();

        let stream = async_stream::stream! {
            let mut decoder = LineDecoder::new();

            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for fragment in decoder.push(&chunk) {
                            yield fragment;
                        }
                    }
                    Err(e) => {
                        warn!(model = %model, error = %e, "Upstream stream failed mid-body");
                        // reqwest labels a cut-off body as a decode error; it is a
                        // transport failure
                        let err = BackendError::Unavailable(format!("stream interrupted: {e}"));
                        yield Fragment::Error(err.to_payload());
                        return;
                    }
                }
            }

            if let Some(fragment) = decoder.finish() {
                yield fragment;
            }
        };

        Ok(Box::pin(stream))
    }

    async fn generate(&self, request: &LlmRequest) -> Result<Completion, BackendError> {
        let start = Instant::now();
        let body = request.clone().with_stream(false).body();

        let response = self
            .http_client
            .post(self.generate_url())
            .json(&body)
            .timeout(self.config.request_timeout())
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let data: Value = response.json().await?;

        if let Some(error) = data.get("error") {
            let message = error
                .as_str()
                .map_or_else(|| error.to_string(), String::from);
            return Err(BackendError::Model(message));
        }

        let content = data
            .get("response")
            .and_then(Value::as_str)
            .ok_or_else(|| BackendError::Decode("response field missing".into()))?
            .to_string();

        Ok(Completion {
            model: request.model.clone(),
            content,
            eval_count: data.get("eval_count").and_then(Value::as_u64),
            elapsed: start.elapsed(),
        })
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, BackendError> {
        let response = self
            .http_client
            .get(self.tags_url())
            .timeout(self.config.list_timeout())
            .send()
            .await?;
        let response = Self::check_status(response).await?;

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models)
    }
}
