//! Scripted in-memory backend
//!
//! Plays back a fixed fragment script per model, optionally with delays,
//! start failures, or streams that never end. Used by the aggregator tests
//! and handy for running the daemon without an inference server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::json;

use crate::backend::{Completion, Fragment, FragmentStream, LlmBackend, LlmRequest, ModelDescriptor};
use crate::error::BackendError;

#[derive(Clone, Debug)]
enum Script {
    Fragments {
        fragments: Vec<Fragment>,
        delay: Duration,
    },
    StartFailure(String),
    Hang,
}

/// Decrements the open-stream counter when a scripted stream is dropped
struct OpenStreamGuard(Arc<AtomicUsize>);

impl OpenStreamGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for OpenStreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Backend that replays scripted fragments per model
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    scripts: HashMap<String, Script>,
    unavailable: bool,
    open_streams: Arc<AtomicUsize>,
}

impl ScriptedBackend {
    /// Backend with no models scripted
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `model` to emit one chunk per entry, then a done line
    #[must_use]
    pub fn with_chunks(self, model: &str, chunks: &[&str]) -> Self {
        let mut fragments: Vec<Fragment> = chunks
            .iter()
            .map(|text| Fragment::from_value(json!({ "model": model, "response": text, "done": false })))
            .collect();
        fragments.push(Fragment::from_value(
            json!({ "model": model, "response": "", "done": true }),
        ));
        self.with_fragments(model, fragments)
    }

    /// Script `model` with an exact fragment sequence
    #[must_use]
    pub fn with_fragments(mut self, model: &str, fragments: Vec<Fragment>) -> Self {
        self.scripts.insert(
            model.to_string(),
            Script::Fragments {
                fragments,
                delay: Duration::ZERO,
            },
        );
        self
    }

    /// Wait `delay` before each of `model`'s fragments
    #[must_use]
    pub fn with_delay(mut self, model: &str, delay: Duration) -> Self {
        if let Some(Script::Fragments { delay: d, .. }) = self.scripts.get_mut(model) {
            *d = delay;
        }
        self
    }

    /// Make starting `model`'s stream fail with an unavailable error
    #[must_use]
    pub fn with_start_failure(mut self, model: &str, message: &str) -> Self {
        self.scripts
            .insert(model.to_string(), Script::StartFailure(message.to_string()));
        self
    }

    /// Make `model`'s stream start but never produce anything
    #[must_use]
    pub fn with_hanging(mut self, model: &str) -> Self {
        self.scripts.insert(model.to_string(), Script::Hang);
        self
    }

    /// Make `list_models` and health checks fail
    #[must_use]
    pub fn unavailable(mut self) -> Self {
        self.unavailable = true;
        self
    }

    /// Scripted streams currently alive (started and not yet dropped)
    #[must_use]
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn script(&self, model: &str) -> Result<&Script, BackendError> {
        self.scripts.get(model).ok_or_else(|| {
            BackendError::Unavailable(format!("upstream returned 404 Not Found: model '{model}' not found"))
        })
    }
}

#[async_trait]
impl LlmBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "Scripted"
    }

    async fn health_check(&self) -> bool {
        !self.unavailable
    }

    async fn stream_completion(
        &self,
        request: &LlmRequest,
    ) -> Result<FragmentStream, BackendError> {
        let (fragments, delay) = match self.script(&request.model)? {
            Script::Fragments { fragments, delay } => (fragments.clone(), *delay),
            Script::StartFailure(message) => {
                return Err(BackendError::Unavailable(message.clone()));
            }
            Script::Hang => {
                let guard = OpenStreamGuard::new(self.open_streams.clone());
                return Ok(Box::pin(async_stream::stream! {
                    let _guard = guard;
                    futures::future::pending::<()>().await;
                    yield Fragment::Error(json!({ "error": "unreachable" }));
                }));
            }
        };

        let guard = OpenStreamGuard::new(self.open_streams.clone());
        Ok(Box::pin(async_stream::stream! {
            let _guard = guard;
            for fragment in fragments {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                yield fragment;
            }
        }))
    }

    async fn generate(&self, request: &LlmRequest) -> Result<Completion, BackendError> {
        let start = Instant::now();
        match self.script(&request.model)? {
            Script::Fragments { fragments, .. } => Ok(Completion {
                model: request.model.clone(),
                content: fragments.iter().filter_map(Fragment::text).collect(),
                eval_count: None,
                elapsed: start.elapsed(),
            }),
            Script::StartFailure(message) => Err(BackendError::Unavailable(message.clone())),
            Script::Hang => Err(BackendError::Unavailable("request timed out".into())),
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelDescriptor>, BackendError> {
        if self.unavailable {
            return Err(BackendError::Unavailable("connection refused".into()));
        }
        let mut names: Vec<&String> = self.scripts.keys().collect();
        names.sort();
        Ok(names
            .into_iter()
            .map(|name| ModelDescriptor {
                name: name.clone(),
                details: serde_json::Map::new(),
            })
            .collect())
    }
}
