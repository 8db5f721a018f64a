//! Stream Aggregator Implementation
//!
//! Fans one prompt out to several models and merges their fragment channels
//! into a single event sequence.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::Stream;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::worker::{StreamWorker, WorkerMessage, WorkerOutcome};
use crate::backend::{Fragment, LlmBackend, LlmRequest};
use crate::config::SessionConfig;
use crate::error::SessionError;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for the aggregator
#[derive(Clone, Debug)]
pub struct AggregatorConfig {
    /// How long to wait after a poll pass that found nothing
    pub idle_poll_interval: Duration,
    /// Capacity of each per-model channel
    pub channel_capacity: usize,
    /// Maximum distinct models in one session
    pub max_models: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self::from(&SessionConfig::default())
    }
}

impl From<&SessionConfig> for AggregatorConfig {
    fn from(config: &SessionConfig) -> Self {
        Self {
            idle_poll_interval: Duration::from_millis(config.idle_poll_ms),
            channel_capacity: config.channel_capacity.max(1),
            max_models: config.max_models,
        }
    }
}

// ============================================================================
// Requests and Events
// ============================================================================

/// One prompt to run against one or more models
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationRequest {
    /// The prompt sent to every model
    pub prompt: String,
    /// Models to run, in the order their channels are polled
    pub models: Vec<String>,
}

impl GenerationRequest {
    /// Create a request
    pub fn new(prompt: impl Into<String>, models: Vec<String>) -> Self {
        Self {
            prompt: prompt.into(),
            models,
        }
    }

    /// Distinct model ids in first-seen order, or why the request is refused
    pub fn distinct_models(&self, max_models: usize) -> Result<Vec<String>, SessionError> {
        if self.models.is_empty() {
            return Err(SessionError::NoModels);
        }

        let mut models: Vec<String> = Vec::with_capacity(self.models.len());
        for model in &self.models {
            if model.trim().is_empty() {
                return Err(SessionError::EmptyModelName);
            }
            if !models.contains(model) {
                models.push(model.clone());
            }
        }

        if models.len() > max_models {
            return Err(SessionError::TooManyModels {
                requested: models.len(),
                max: max_models,
            });
        }

        Ok(models)
    }
}

/// Unique identifier of one aggregate session, used for log correlation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Generate a fresh id
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event in a session's merged output
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    /// First event of every session
    Start {
        /// All models in the session, in polling order
        models: Vec<String>,
    },
    /// A model produced text
    ModelUpdate {
        /// Model the text came from
        model: String,
        /// The new piece
        chunk: String,
        /// Everything the model has produced so far
        full_text: String,
    },
    /// A model finished; nothing more will be reported for it
    ModelComplete {
        /// Model that finished
        model: String,
    },
    /// An error or unrecognised payload for one model
    ModelMessage {
        /// Model concerned
        model: String,
        /// Raw payload
        message: Value,
    },
    /// Last event of every session
    End {
        /// Human-readable summary
        message: String,
    },
}

impl SessionEvent {
    /// Wire tag of this event
    #[must_use]
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::ModelUpdate { .. } => "model-update",
            Self::ModelComplete { .. } => "model-complete",
            Self::ModelMessage { .. } => "model-message",
            Self::End { .. } => "end",
        }
    }

    /// JSON payload of this event
    #[must_use]
    pub fn payload(&self) -> Value {
        match self {
            Self::Start { models } => json!({
                "message": format!("Starting generation with models: {}", models.join(", ")),
                "models": models,
            }),
            Self::ModelUpdate {
                model,
                chunk,
                full_text,
            } => json!({ "model": model, "chunk": chunk, "full_text": full_text }),
            Self::ModelComplete { model } => json!({ "model": model }),
            Self::ModelMessage { model, message } => json!({ "model": model, "message": message }),
            Self::End { message } => json!({ "message": message }),
        }
    }

    /// Model this event belongs to, if it is model-scoped
    #[must_use]
    pub fn model(&self) -> Option<&str> {
        match self {
            Self::ModelUpdate { model, .. }
            | Self::ModelComplete { model }
            | Self::ModelMessage { model, .. } => Some(model),
            Self::Start { .. } | Self::End { .. } => None,
        }
    }
}

/// Merged event output of one session
pub type SessionEventStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

// ============================================================================
// Model Stream State
// ============================================================================

/// Per-model state, owned and mutated only by the session
#[derive(Debug)]
pub struct ModelStreamState {
    model_id: String,
    accumulated_text: String,
    completed: bool,
    receiver: mpsc::Receiver<WorkerMessage>,
    chunks_received: u32,
    started_at: Instant,
    first_chunk_at: Option<Instant>,
}

impl ModelStreamState {
    fn new(model_id: String, receiver: mpsc::Receiver<WorkerMessage>) -> Self {
        Self {
            model_id,
            accumulated_text: String::new(),
            completed: false,
            receiver,
            chunks_received: 0,
            started_at: Instant::now(),
            first_chunk_at: None,
        }
    }

    /// The model this state tracks
    #[must_use]
    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Everything received so far
    #[must_use]
    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    /// Whether the model has finished
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Number of text chunks received
    #[must_use]
    pub fn chunks_received(&self) -> u32 {
        self.chunks_received
    }

    /// Take at most one message from the channel (non-blocking).
    ///
    /// Returns the events it produces, which are empty when the channel had
    /// nothing ready.
    fn poll(&mut self) -> Vec<SessionEvent> {
        if self.completed {
            return Vec::new();
        }

        match self.receiver.try_recv() {
            Ok(WorkerMessage::Fragment(fragment)) => self.apply(fragment),
            Ok(WorkerMessage::Finished) => vec![self.complete()],
            Err(mpsc::error::TryRecvError::Empty) => Vec::new(),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                // Worker task ended without its sentinel (aborted or panicked)
                warn!(model = %self.model_id, "Worker channel closed without completion");
                vec![
                    SessionEvent::ModelMessage {
                        model: self.model_id.clone(),
                        message: json!({ "error": "Stream disconnected unexpectedly" }),
                    },
                    self.complete(),
                ]
            }
        }
    }

    fn apply(&mut self, fragment: Fragment) -> Vec<SessionEvent> {
        let mut events = Vec::new();

        if let Some(text) = fragment.text() {
            events.push(self.append(text));
        }

        match fragment {
            Fragment::Chunk { .. } => {}
            Fragment::Done { .. } => events.push(self.complete()),
            Fragment::Error(payload) => events.push(SessionEvent::ModelMessage {
                model: self.model_id.clone(),
                message: payload,
            }),
        }

        events
    }

    fn append(&mut self, chunk: &str) -> SessionEvent {
        if self.first_chunk_at.is_none() {
            self.first_chunk_at = Some(Instant::now());
        }
        self.chunks_received += 1;
        self.accumulated_text.push_str(chunk);

        SessionEvent::ModelUpdate {
            model: self.model_id.clone(),
            chunk: chunk.to_string(),
            full_text: self.accumulated_text.clone(),
        }
    }

    fn complete(&mut self) -> SessionEvent {
        self.completed = true;
        // Nothing after completion is read; release the channel now so the
        // worker sees a closed receiver instead of blocking on a full buffer.
        self.receiver.close();

        debug!(
            model = %self.model_id,
            chunks = self.chunks_received,
            chars = self.accumulated_text.len(),
            first_chunk_ms = ?self
                .first_chunk_at
                .map(|t| t.duration_since(self.started_at).as_millis() as u64),
            total_ms = self.started_at.elapsed().as_millis() as u64,
            "Model completed"
        );

        SessionEvent::ModelComplete {
            model: self.model_id.clone(),
        }
    }
}

// ============================================================================
// Aggregate Session
// ============================================================================

/// All per-model state and worker tasks for one request.
///
/// Dropping the session aborts every worker still running, which releases
/// their upstream connections.
pub struct AggregateSession {
    id: SessionId,
    states: Vec<ModelStreamState>,
    workers: JoinSet<WorkerOutcome>,
    idle_poll_interval: Duration,
    started_at: Instant,
}

impl AggregateSession {
    /// Session identifier
    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Models in polling order
    #[must_use]
    pub fn models(&self) -> Vec<String> {
        self.states.iter().map(|s| s.model_id.clone()).collect()
    }

    /// State of one model
    #[must_use]
    pub fn state(&self, model: &str) -> Option<&ModelStreamState> {
        self.states.iter().find(|s| s.model_id == model)
    }

    /// Whether every model has completed
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.states.iter().all(ModelStreamState::is_completed)
    }

    /// One round-robin pass: a single non-blocking poll of every model that
    /// has not completed, in model order.
    pub fn poll_pass(&mut self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for state in self.states.iter_mut().filter(|s| !s.completed) {
            events.extend(state.poll());
        }
        events
    }

    /// Drive the session to completion as a stream of events.
    ///
    /// Yields `Start`, then model events as they are drained, then `End`
    /// once every model has completed. Dropping the stream early cancels
    /// the session.
    pub fn into_events(mut self) -> SessionEventStream {
        Box::pin(async_stream::stream! {
            yield SessionEvent::Start { models: self.models() };

            while !self.is_complete() {
                let events = self.poll_pass();
                if events.is_empty() {
                    tokio::time::sleep(self.idle_poll_interval).await;
                    continue;
                }
                for event in events {
                    yield event;
                }
            }

            info!(
                session = %self.id,
                elapsed_ms = self.started_at.elapsed().as_millis() as u64,
                "Session completed"
            );
            yield SessionEvent::End { message: "All models completed".to_string() };
        })
    }
}

impl Drop for AggregateSession {
    fn drop(&mut self) {
        if !self.is_complete() {
            let pending: Vec<&str> = self
                .states
                .iter()
                .filter(|s| !s.completed)
                .map(ModelStreamState::model_id)
                .collect();
            info!(
                session = %self.id,
                pending = ?pending,
                "Session dropped before completion, aborting workers"
            );
        }
        self.workers.abort_all();
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Starts multi-model sessions against one backend
#[derive(Clone)]
pub struct Aggregator {
    backend: Arc<dyn LlmBackend>,
    config: AggregatorConfig,
}

impl Aggregator {
    /// Create an aggregator
    pub fn new(backend: Arc<dyn LlmBackend>, config: AggregatorConfig) -> Self {
        Self { backend, config }
    }

    /// Current configuration
    #[must_use]
    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// The backend workers stream from
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn LlmBackend> {
        &self.backend
    }

    /// Validate `request` and start one worker per distinct model.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, request: &GenerationRequest) -> Result<AggregateSession, SessionError> {
        let models = request.distinct_models(self.config.max_models)?;
        let id = SessionId::new();

        let mut states = Vec::with_capacity(models.len());
        let mut workers = JoinSet::new();

        for model in models {
            let (tx, rx) = mpsc::channel(self.config.channel_capacity);
            let worker = StreamWorker::new(
                Arc::clone(&self.backend),
                LlmRequest::new(request.prompt.clone(), model.clone()),
                tx,
            );
            workers.spawn(worker.run());
            states.push(ModelStreamState::new(model, rx));
        }

        info!(
            session = %id,
            backend = self.backend.name(),
            models = ?states.iter().map(ModelStreamState::model_id).collect::<Vec<_>>(),
            "Session started"
        );

        Ok(AggregateSession {
            id,
            states,
            workers,
            idle_poll_interval: self.config.idle_poll_interval,
            started_at: Instant::now(),
        })
    }

    /// Validate, start, and return the merged event stream
    pub fn stream(&self, request: &GenerationRequest) -> Result<SessionEventStream, SessionError> {
        Ok(self.start(request)?.into_events())
    }
}

// ============================================================================
// Tests
// ============================================================================
