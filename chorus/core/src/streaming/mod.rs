//! Streaming Infrastructure for Multi-Model Sessions
//!
//! One prompt fans out to several models; each model's upstream stream is
//! relayed by its own worker task into its own channel, and the session
//! drains those channels round-robin into one merged event sequence.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                        AggregateSession                          │
//! │                                                                  │
//! │   StreamWorker(a) ──► mpsc ──► ModelStreamState(a) ─┐            │
//! │   StreamWorker(b) ──► mpsc ──► ModelStreamState(b) ─┼─ poll_pass │
//! │   StreamWorker(c) ──► mpsc ──► ModelStreamState(c) ─┘     │      │
//! │                                                           ▼      │
//! │                  start, model-update, model-complete,            │
//! │                  model-message, ..., end                         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - **No head-of-line blocking**: each pass takes at most one message per
//!   model with `try_recv`, so a slow model never delays a fast one
//! - **Per-model order**: fragments of one model are delivered in the order
//!   upstream produced them; there is no ordering contract across models
//! - **Termination**: every worker ends with a sentinel, and a channel that
//!   closes without one is treated as finished
//! - **Cancellation**: dropping the session aborts its workers
//!
//! # Example
//!
//! ```ignore
//! use chorus_core::streaming::{Aggregator, AggregatorConfig, GenerationRequest};
//! use futures::StreamExt;
//!
//! let aggregator = Aggregator::new(backend, AggregatorConfig::default());
//! let request = GenerationRequest::new("hi", vec!["llama3.2".into(), "mistral".into()]);
//! let mut events = aggregator.stream(&request)?;
//! while let Some(event) = events.next().await {
//!     println!("{}: {}", event.tag(), event.payload());
//! }
//! ```

mod aggregator;
mod worker;

pub use aggregator::{
    AggregateSession, Aggregator, AggregatorConfig, GenerationRequest, ModelStreamState,
    SessionEvent, SessionEventStream, SessionId,
};
pub use worker::{StreamWorker, WorkerMessage, WorkerOutcome};

// Re-export Fragment from backend for convenience
pub use crate::backend::Fragment;
