//! Actor wrapper around the turn orchestrator.
//!
//! Message-passing front end so the presentation loop never holds the
//! orchestrator across an await: commands go in over an mpsc channel,
//! responses come back over another, and a `CancellationToken` lets the user
//! abandon a turn mid-flight without tearing the process down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{SessionContext, TurnOrchestrator, TurnOutcome};
use crate::error::{ParleyError, Result};

/// Unique identifier for a submitted turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TurnId(u64);

impl TurnId {
    /// Generates a new unique turn ID.
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TurnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Commands sent from the presentation layer to the actor.
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Run a full turn for a user prompt.
    SubmitPrompt {
        id: TurnId,
        prompt: String,
        ctx: SessionContext,
        cancel: CancellationToken,
    },
    /// Request a chart recommendation for a result message.
    RequestVisualization {
        id: TurnId,
        message_id: i64,
        ctx: SessionContext,
        cancel: CancellationToken,
    },
    /// Gracefully close the actor.
    Shutdown,
}

/// Responses sent from the actor back to the presentation layer.
#[derive(Debug, Clone)]
pub enum OrchestratorResponse {
    /// The turn started processing.
    Started { id: TurnId },
    /// The turn ran to a terminal message.
    Completed { id: TurnId, outcome: TurnOutcome },
    /// The turn failed without a terminal message (store/config errors).
    Failed { id: TurnId, error: String },
    /// The turn was cancelled mid-flight.
    Cancelled { id: TurnId },
    /// A visualization request finished (its outcome is in the message log).
    VisualizationDone { id: TurnId },
}

/// The actor that owns command processing for a `TurnOrchestrator`.
pub struct OrchestratorActor {
    orchestrator: Arc<TurnOrchestrator>,
    receiver: mpsc::Receiver<OrchestratorCommand>,
    response_tx: mpsc::Sender<OrchestratorResponse>,
}

impl OrchestratorActor {
    /// Creates a new actor and returns a handle for communication.
    pub fn spawn(
        orchestrator: Arc<TurnOrchestrator>,
        response_tx: mpsc::Sender<OrchestratorResponse>,
    ) -> (OrchestratorHandle, Self) {
        let (sender, receiver) = mpsc::channel(32);

        let actor = Self {
            orchestrator,
            receiver,
            response_tx,
        };

        (OrchestratorHandle { sender }, actor)
    }

    /// Runs the actor loop, processing commands until Shutdown is received.
    pub async fn run(mut self) {
        while let Some(command) = self.receiver.recv().await {
            match command {
                OrchestratorCommand::SubmitPrompt {
                    id,
                    prompt,
                    ctx,
                    cancel,
                } => {
                    self.process_prompt(id, &prompt, ctx, cancel).await;
                }
                OrchestratorCommand::RequestVisualization {
                    id,
                    message_id,
                    ctx,
                    cancel,
                } => {
                    self.process_visualization(id, message_id, ctx, cancel).await;
                }
                OrchestratorCommand::Shutdown => break,
            }
        }
    }

    async fn process_prompt(
        &self,
        id: TurnId,
        prompt: &str,
        ctx: SessionContext,
        cancel: CancellationToken,
    ) {
        let _ = self
            .response_tx
            .send(OrchestratorResponse::Started { id })
            .await;

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                // The turn future is dropped; release the session so the
                // next submit is not rejected as still in progress.
                self.orchestrator.reset_session(ctx.session_id);
                let _ = self.response_tx.send(OrchestratorResponse::Cancelled { id }).await;
            }
            result = self.orchestrator.submit_prompt(prompt, &ctx) => {
                let response = match result {
                    Ok(outcome) => OrchestratorResponse::Completed { id, outcome },
                    Err(e) => {
                        warn!(turn = %id, error = %e, "Turn failed");
                        OrchestratorResponse::Failed { id, error: e.to_string() }
                    }
                };
                let _ = self.response_tx.send(response).await;
            }
        }
    }

    async fn process_visualization(
        &self,
        id: TurnId,
        message_id: i64,
        ctx: SessionContext,
        cancel: CancellationToken,
    ) {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                let _ = self.response_tx.send(OrchestratorResponse::Cancelled { id }).await;
            }
            result = self.orchestrator.request_visualization(message_id, &ctx) => {
                let response = match result {
                    Ok(()) => OrchestratorResponse::VisualizationDone { id },
                    Err(e) => OrchestratorResponse::Failed { id, error: e.to_string() },
                };
                let _ = self.response_tx.send(response).await;
            }
        }
    }
}

/// Handle for communicating with the orchestrator actor.
///
/// Lightweight and cloneable; responses come back via the response channel.
#[derive(Clone)]
pub struct OrchestratorHandle {
    sender: mpsc::Sender<OrchestratorCommand>,
}

impl OrchestratorHandle {
    /// Submits a prompt for processing. Returns immediately after queueing.
    pub async fn submit_prompt(
        &self,
        id: TurnId,
        prompt: String,
        ctx: SessionContext,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.sender
            .send(OrchestratorCommand::SubmitPrompt {
                id,
                prompt,
                ctx,
                cancel,
            })
            .await
            .map_err(|_| ParleyError::internal("Orchestrator actor closed"))
    }

    /// Requests a visualization recommendation for a result message.
    pub async fn request_visualization(
        &self,
        id: TurnId,
        message_id: i64,
        ctx: SessionContext,
        cancel: CancellationToken,
    ) -> Result<()> {
        self.sender
            .send(OrchestratorCommand::RequestVisualization {
                id,
                message_id,
                ctx,
                cancel,
            })
            .await
            .map_err(|_| ParleyError::internal("Orchestrator actor closed"))
    }

    /// Signals the actor to close gracefully.
    pub async fn close(&self) -> Result<()> {
        self.sender
            .send(OrchestratorCommand::Shutdown)
            .await
            .map_err(|_| ParleyError::internal("Orchestrator actor already closed"))
    }
}
