//! LLM Backend Integration
//!
//! This module provides abstracted access to the inference server through a
//! common trait interface.
//!
//! # Available Backends
//!
//! - **Ollama**: Local LLM server (default)
//!
//! # Usage
//!
//! ```ignore
//! use chorus_core::backend::{LlmBackend, LlmRequest, OllamaBackend};
//! use futures::StreamExt;
//!
//! let backend = OllamaBackend::new("localhost", 11434)?;
//! let mut fragments = backend
//!     .stream_completion(&LlmRequest::new("Hello!", "llama3.2"))
//!     .await?;
//! while let Some(fragment) = fragments.next().await {
//!     println!("{fragment:?}");
//! }
//! ```

mod ndjson;
mod ollama;
mod traits;

pub use ndjson::{LineDecoder, DEFAULT_MAX_LINE_BYTES};
pub use ollama::OllamaBackend;
pub use traits::{
    Completion, Fragment, FragmentStream, LlmBackend, LlmRequest, ModelDescriptor,
};
