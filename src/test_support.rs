//! Shared fixtures for unit and integration tests: a frame-recording
//! subscriber channel and a manually-driven transport.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::model::{ActionSpec, ExecutionResult};
use crate::streaming::{ChannelClosed, Frame, FrameEvent, StreamChannel};
use crate::transport::{CancelSupport, StreamingCallbacks, TransportError, TransportExecutor};

/// Subscriber channel that records every delivered frame and can be told
/// to start failing writes, standing in for a disconnected client.
#[derive(Default)]
pub struct RecordingChannel {
    frames: Mutex<Vec<Frame>>,
    failing: AtomicBool,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn frames(&self) -> Vec<Frame> {
        self.frames.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<FrameEvent> {
        self.frames.lock().unwrap().iter().map(|f| f.event).collect()
    }

    pub fn frames_of(&self, event: FrameEvent) -> Vec<Frame> {
        self.frames
            .lock()
            .unwrap()
            .iter()
            .filter(|f| f.event == event)
            .cloned()
            .collect()
    }
}

impl StreamChannel for RecordingChannel {
    fn write(&self, frame: &Frame) -> Result<(), ChannelClosed> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ChannelClosed);
        }
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

/// Transport whose runs park until the test completes them, so tests can
/// observe intermediate queue states deterministically.
#[derive(Default)]
pub struct ManualTransport {
    started: Mutex<Vec<Uuid>>,
    gates: Mutex<HashMap<Uuid, oneshot::Sender<ExecutionResult>>>,
}

impl ManualTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Execution ids handed to `run` so far, in dispatch order.
    pub fn started(&self) -> Vec<Uuid> {
        self.started.lock().unwrap().clone()
    }

    pub fn started_count(&self) -> usize {
        self.started.lock().unwrap().len()
    }

    /// Release one parked run with the given result.
    pub fn complete(&self, execution_id: Uuid, result: ExecutionResult) {
        if let Some(gate) = self.gates.lock().unwrap().remove(&execution_id) {
            let _ = gate.send(result);
        }
    }

    /// Wait until at least `count` runs have started.
    pub async fn wait_for_started(&self, count: usize) {
        wait_until(|| self.started_count() >= count).await;
    }
}

#[async_trait]
impl TransportExecutor for ManualTransport {
    async fn run(
        &self,
        execution_id: Uuid,
        _target: &str,
        _action: &ActionSpec,
        _callbacks: Arc<dyn StreamingCallbacks>,
    ) -> Result<ExecutionResult, TransportError> {
        let (gate, release) = oneshot::channel();
        self.gates.lock().unwrap().insert(execution_id, gate);
        self.started.lock().unwrap().push(execution_id);
        match release.await {
            Ok(result) => Ok(result),
            Err(_) => Ok(ExecutionResult::failed(None)),
        }
    }

    async fn cancel(&self, execution_id: Uuid) -> CancelSupport {
        if self.gates.lock().unwrap().contains_key(&execution_id) {
            CancelSupport::Requested
        } else {
            CancelSupport::Unsupported
        }
    }
}

/// Transport that fails every run with the given message.
pub struct FailingTransport {
    pub message: String,
}

#[async_trait]
impl TransportExecutor for FailingTransport {
    async fn run(
        &self,
        _execution_id: Uuid,
        _target: &str,
        _action: &ActionSpec,
        _callbacks: Arc<dyn StreamingCallbacks>,
    ) -> Result<ExecutionResult, TransportError> {
        Err(TransportError::Failed(self.message.clone()))
    }
}

/// Poll `predicate` until it holds, panicking after five seconds.
pub async fn wait_until(predicate: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if predicate() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within deadline");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
