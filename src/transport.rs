//! Transport executor contract.
//!
//! The queue hands each dispatched unit to a [`TransportExecutor`], which
//! performs the action against the target however it likes (local process,
//! SSH, an orchestration agent) and reports incremental output through
//! [`StreamingCallbacks`] before returning a terminal result. The queue and
//! hub never depend on a concrete transport.

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ActionKind, ActionSpec, ExecutionResult};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport does not support {0} actions")]
    UnsupportedAction(ActionKind),
    #[error("transport failure: {0}")]
    Failed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of a best-effort cancellation request for a running unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSupport {
    /// The transport accepted the request; the action may still finish.
    Requested,
    /// The transport cannot stop work already in flight.
    Unsupported,
}

/// Incremental output sink invoked by the transport while a unit runs.
///
/// Implementations must not block: chunks are handed straight to the
/// streaming hub, which buffers and debounces before fan-out.
pub trait StreamingCallbacks: Send + Sync {
    fn on_stdout(&self, chunk: &str);
    fn on_stderr(&self, chunk: &str);
    /// Announces the concrete command line the transport is about to run.
    fn on_command(&self, command: &str);
}

#[async_trait]
pub trait TransportExecutor: Send + Sync {
    /// Run `action` against `target`, reporting output through `callbacks`.
    ///
    /// Errors are captured on the execution unit as a `failed` terminal
    /// status by the queue; they never propagate further.
    async fn run(
        &self,
        execution_id: Uuid,
        target: &str,
        action: &ActionSpec,
        callbacks: std::sync::Arc<dyn StreamingCallbacks>,
    ) -> Result<ExecutionResult, TransportError>;

    /// Best-effort cancellation of a unit already handed to `run`.
    async fn cancel(&self, execution_id: Uuid) -> CancelSupport {
        let _ = execution_id;
        CancelSupport::Unsupported
    }
}
