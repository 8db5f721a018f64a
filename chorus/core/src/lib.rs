//! Chorus Core - Multi-Model Streaming Fan-Out
//!
//! This crate sends one prompt to several models on a local inference server
//! at the same time and merges their token streams into a single ordered
//! event sequence. It has no HTTP server dependencies; the daemon crate puts
//! it behind an HTTP front end.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          HTTP Front End                          │
//! │                       (chorus-daemon, axum)                      │
//! └───────────────────────────────┬─────────────────────────────────┘
//!                                 │ GenerationRequest
//!                                 ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           CHORUS CORE                            │
//! │  ┌─────────────┐   ┌────────────────┐   ┌────────────────────┐  │
//! │  │ Aggregator  │──►│ StreamWorker×N │──►│   LlmBackend       │  │
//! │  │ (sessions)  │◄──│ (one per model)│   │ (Ollama, Scripted) │  │
//! │  └──────┬──────┘   └────────────────┘   └────────────────────┘  │
//! │         │ SessionEvent                                           │
//! │         ▼                                                        │
//! │  ┌─────────────┐                                                 │
//! │  │ EventEncoder│──► event: <tag>\ndata: <json>\n\n               │
//! │  └─────────────┘                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Aggregator`]: Starts sessions against a shared backend
//! - [`AggregateSession`]: One in-flight fan-out; dropping it cancels workers
//! - [`SessionEvent`]: The merged event sequence a session produces
//! - [`OllamaBackend`]: NDJSON streaming client for the inference server
//! - [`EventEncoder`]: Server-sent-event framing for session events
//!
//! # Module Overview
//!
//! - [`backend`]: Backend trait, fragments, and the Ollama client
//! - [`config`]: Layered configuration (defaults, file, env, CLI)
//! - [`encoder`]: Event stream wire format
//! - [`error`]: Error types shared across the crate
//! - [`streaming`]: Workers, per-model state, and the aggregator
//! - `testing`: Scripted in-memory backend (unit tests, or the `testing`
//!   feature)

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod encoder;
pub mod error;
pub mod streaming;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Re-exports for convenience
pub use backend::{
    Completion, Fragment, FragmentStream, LlmBackend, LlmRequest, ModelDescriptor, OllamaBackend,
};
pub use error::{BackendError, SessionError};

// Streaming exports
pub use streaming::{
    AggregateSession, Aggregator, AggregatorConfig, GenerationRequest, SessionEvent,
    SessionEventStream, SessionId,
};

// Encoder exports
pub use encoder::{encode_data, encode_frame, EventDecoder, EventEncoder};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, BackendConfig, ChorusConfig,
    ConfigError, ConfigOverrides, ConfigSource, ServerConfig, SessionConfig,
};
