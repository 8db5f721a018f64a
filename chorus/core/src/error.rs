//! Error types shared across the backend client and the stream aggregator.

use thiserror::Error;

/// Failures talking to the inference server.
///
/// Only [`BackendError::Unavailable`] ever escapes to a caller; decode and
/// model errors are turned into error fragments at the point they occur so a
/// single bad line never tears down a model's stream.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Server unreachable, timed out, or answered with a non-success status
    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    /// A line of the upstream response was not valid JSON
    #[error("failed to decode upstream response: {0}")]
    Decode(String),

    /// The upstream server reported an error for a specific model
    #[error("model error: {0}")]
    Model(String),
}

impl BackendError {
    /// Build an `Unavailable` error from a non-success HTTP status and body.
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        if body.trim().is_empty() {
            Self::Unavailable(format!("upstream returned {status}"))
        } else {
            Self::Unavailable(format!("upstream returned {status}: {}", body.trim()))
        }
    }

    /// Payload used when this error is surfaced as an error fragment
    #[must_use]
    pub fn to_payload(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Reasons a generation request is refused before any session is created.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The request named no models
    #[error("No models specified")]
    NoModels,

    /// The request named more distinct models than the configured limit
    #[error("too many models requested: {requested} (max: {max})")]
    TooManyModels {
        /// Distinct models in the request
        requested: usize,
        /// Configured maximum
        max: usize,
    },

    /// A model identifier was blank
    #[error("model identifiers must not be empty")]
    EmptyModelName,
}
