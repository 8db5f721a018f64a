//! Per-Model Stream Worker
//!
//! Bridges one backend stream into one channel. A worker owns the only
//! sender of its channel and always finishes with
//! [`WorkerMessage::Finished`], whatever happened upstream.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backend::{Fragment, LlmBackend, LlmRequest};

/// What travels over a per-model channel
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerMessage {
    /// A fragment received from upstream
    Fragment(Fragment),
    /// Sentinel: no more fragments for this model
    Finished,
}

/// Summary of a worker run, returned from its task
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WorkerOutcome {
    /// Fragments forwarded to the channel
    pub fragments: usize,
    /// The stream could not be started
    pub failed_to_start: bool,
    /// The receiver went away before the worker finished
    pub receiver_closed: bool,
}

/// Relays one model's streaming completion into its channel
pub struct StreamWorker {
    backend: Arc<dyn LlmBackend>,
    request: LlmRequest,
    sender: mpsc::Sender<WorkerMessage>,
}

impl StreamWorker {
    /// Create a worker for one (model, prompt) pair
    pub fn new(
        backend: Arc<dyn LlmBackend>,
        request: LlmRequest,
        sender: mpsc::Sender<WorkerMessage>,
    ) -> Self {
        Self {
            backend,
            request,
            sender,
        }
    }

    /// The model this worker streams
    #[must_use]
    pub fn model(&self) -> &str {
        &self.request.model
    }

    /// Consume the upstream stream to exhaustion, then send the sentinel.
    ///
    /// If the stream cannot be started, a single error fragment is sent
    /// before the sentinel. Stops quietly once the receiver is dropped.
    pub async fn run(self) -> WorkerOutcome {
        let model = self.request.model.clone();
        let mut outcome = WorkerOutcome::default();

        match self.backend.stream_completion(&self.request).await {
            Ok(mut fragments) => {
                while let Some(fragment) = fragments.next().await {
                    if self.send(WorkerMessage::Fragment(fragment)).await.is_err() {
                        debug!(model = %model, "Receiver dropped, abandoning stream");
                        outcome.receiver_closed = true;
                        return outcome;
                    }
                    outcome.fragments += 1;
                }
            }
            Err(e) => {
                warn!(model = %model, error = %e, "Failed to start model stream");
                outcome.failed_to_start = true;
                if self
                    .send(WorkerMessage::Fragment(Fragment::Error(e.to_payload())))
                    .await
                    .is_err()
                {
                    outcome.receiver_closed = true;
                    return outcome;
                }
            }
        }

        if self.send(WorkerMessage::Finished).await.is_err() {
            outcome.receiver_closed = true;
        }

        debug!(
            model = %model,
            fragments = outcome.fragments,
            failed_to_start = outcome.failed_to_start,
            "Worker finished"
        );
        outcome
    }

    async fn send(&self, message: WorkerMessage) -> Result<(), mpsc::error::SendError<WorkerMessage>> {
        self.sender.send(message).await
    }
}
