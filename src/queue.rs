//! Execution queue: admission control and dispatch.
//!
//! Submissions are admitted against a single capacity bound (queued plus
//! running must stay at or under `max_queue_size`) and wait in FIFO order.
//! The dispatch loop hands the oldest waiting unit to the transport
//! whenever the running count is below `concurrent_limit`; the capacity
//! check and the pop are one atomic step under the queue lock, so
//! concurrent submissions and completions cannot race past either limit.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use anyhow::{Result, anyhow};
use chrono::Utc;
use thiserror::Error;
use tokio::{
    sync::{Notify, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::model::{ActionSpec, Batch, ExecutionResult, ExecutionStatus, ExecutionUnit};
use crate::streaming::StreamingHub;
use crate::transport::{CancelSupport, StreamingCallbacks, TransportExecutor};

#[derive(Debug, Error)]
pub enum SubmitError {
    /// Admission rejected: the caller should wait and retry. The queue
    /// never retries on its own.
    #[error("execution queue is full ({capacity} pending executions), wait and retry")]
    QueueFull { capacity: usize },
}

#[derive(Debug, Error)]
pub enum CancelError {
    #[error("execution not found: {0}")]
    NotFound(Uuid),
}

/// What a cancellation request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The unit was still queued and has been removed.
    Cancelled,
    /// The unit is running; the transport accepted a best-effort stop.
    Requested,
    /// The unit is running and the transport cannot stop it.
    Unsupported,
    /// The unit had already reached a terminal status.
    AlreadyFinished(ExecutionStatus),
}

struct QueueState {
    waiting: VecDeque<Uuid>,
    units: HashMap<Uuid, ExecutionUnit>,
    batches: HashMap<Uuid, Batch>,
    /// Terminal unit ids in completion order, oldest first. Bounds how many
    /// finished records `units`/`batches` retain for status lookups.
    finished: VecDeque<Uuid>,
    running: usize,
}

impl QueueState {
    fn pending(&self) -> usize {
        self.waiting.len() + self.running
    }

    /// Record a unit as terminal and evict the oldest finished records past
    /// `max_history`. A batch record is released together with the last of
    /// its units.
    fn record_finished(&mut self, execution_id: Uuid, max_history: usize) {
        self.finished.push_back(execution_id);
        while self.finished.len() > max_history {
            let Some(oldest) = self.finished.pop_front() else {
                break;
            };
            let Some(unit) = self.units.remove(&oldest) else {
                continue;
            };
            if let Some(batch_id) = unit.batch_id {
                let all_evicted = self
                    .batches
                    .get(&batch_id)
                    .is_some_and(|batch| {
                        batch
                            .execution_ids
                            .iter()
                            .all(|id| !self.units.contains_key(id))
                    });
                if all_evicted {
                    self.batches.remove(&batch_id);
                }
            }
        }
    }
}

struct QueueInner {
    config: QueueConfig,
    transport: Arc<dyn TransportExecutor>,
    hub: StreamingHub,
    state: Mutex<QueueState>,
    wakeup: Notify,
}

/// Admission-controlled FIFO execution queue, shared by cloning.
///
/// Call [`ExecutionQueue::start`] once from the composition root to spawn
/// the dispatch loop; the returned worker handle owns loop shutdown.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
}

/// Handle to the running dispatch loop.
pub struct QueueWorker {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        self.handle
            .await
            .map_err(|err| anyhow!("dispatch loop panicked: {err}"))
    }
}

impl ExecutionQueue {
    pub fn new(
        config: QueueConfig,
        transport: Arc<dyn TransportExecutor>,
        hub: StreamingHub,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                transport,
                hub,
                state: Mutex::new(QueueState {
                    waiting: VecDeque::new(),
                    units: HashMap::new(),
                    batches: HashMap::new(),
                    finished: VecDeque::new(),
                    running: 0,
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Spawn the dispatch loop.
    pub fn start(&self) -> QueueWorker {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            info!(
                concurrent_limit = inner.config.concurrent_limit,
                max_queue_size = inner.config.max_queue_size,
                "starting dispatch loop",
            );
            loop {
                dispatch_ready(&inner);
                tokio::select! {
                    _ = inner.wakeup.notified() => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_ok() && *shutdown_rx.borrow() {
                            info!("dispatch loop shutting down");
                            break;
                        }
                    }
                }
            }
        });
        QueueWorker {
            shutdown_tx,
            handle,
        }
    }

    /// Admit one unit, FIFO. Returns immediately; dispatch happens as
    /// capacity frees up.
    pub fn submit(&self, unit: ExecutionUnit) -> Result<Uuid, SubmitError> {
        let id = {
            let mut state = self.lock();
            if state.pending() >= self.inner.config.max_queue_size {
                metrics::counter!("runway_queue_rejections_total").increment(1);
                return Err(SubmitError::QueueFull {
                    capacity: self.inner.config.max_queue_size,
                });
            }
            let id = unit.id;
            state.waiting.push_back(id);
            state.units.insert(id, unit);
            id
        };
        self.inner.wakeup.notify_one();
        Ok(id)
    }

    /// Admit one unit per target, all-or-nothing: either the whole batch
    /// fits under `max_queue_size` or nothing is queued.
    pub fn submit_batch(
        &self,
        targets: Vec<String>,
        action: ActionSpec,
    ) -> Result<Batch, SubmitError> {
        let batch_id = Uuid::new_v4();
        let batch = {
            let mut state = self.lock();
            if state.pending() + targets.len() > self.inner.config.max_queue_size {
                metrics::counter!("runway_queue_rejections_total").increment(1);
                return Err(SubmitError::QueueFull {
                    capacity: self.inner.config.max_queue_size,
                });
            }
            let mut execution_ids = Vec::with_capacity(targets.len());
            for target in &targets {
                let unit = ExecutionUnit::new(Some(batch_id), target.clone(), action.clone());
                execution_ids.push(unit.id);
                state.waiting.push_back(unit.id);
                state.units.insert(unit.id, unit);
            }
            let batch = Batch {
                batch_id,
                execution_ids,
                target_count: targets.len(),
                expanded_node_ids: targets,
            };
            state.batches.insert(batch_id, batch.clone());
            batch
        };
        debug!(
            batch_id = %batch.batch_id,
            targets = batch.target_count,
            "batch admitted",
        );
        self.inner.wakeup.notify_one();
        Ok(batch)
    }

    /// Cancel a unit. Queued units cancel synchronously and for free;
    /// running units depend entirely on transport support.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<CancelOutcome, CancelError> {
        let status = {
            let mut state = self.lock();
            let unit = state
                .units
                .get_mut(&execution_id)
                .ok_or(CancelError::NotFound(execution_id))?;
            match unit.status {
                ExecutionStatus::Queued => {
                    unit.status = ExecutionStatus::Cancelled;
                    unit.completed_at = Some(Utc::now());
                    state.waiting.retain(|id| *id != execution_id);
                    state.record_finished(execution_id, self.inner.config.max_history);
                    ExecutionStatus::Cancelled
                }
                status => status,
            }
        };
        match status {
            ExecutionStatus::Cancelled => {
                // Terminal for the stream too: flush, notify, tear down.
                self.inner.hub.emit_complete(
                    execution_id,
                    &ExecutionResult {
                        status: ExecutionStatus::Cancelled,
                        output: None,
                    },
                );
                Ok(CancelOutcome::Cancelled)
            }
            ExecutionStatus::Running => {
                match self.inner.transport.cancel(execution_id).await {
                    CancelSupport::Requested => Ok(CancelOutcome::Requested),
                    CancelSupport::Unsupported => Ok(CancelOutcome::Unsupported),
                }
            }
            terminal => Ok(CancelOutcome::AlreadyFinished(terminal)),
        }
    }

    pub fn status(&self, execution_id: Uuid) -> Option<ExecutionStatus> {
        self.lock().units.get(&execution_id).map(|unit| unit.status)
    }

    pub fn unit(&self, execution_id: Uuid) -> Option<ExecutionUnit> {
        self.lock().units.get(&execution_id).cloned()
    }

    pub fn batch(&self, batch_id: Uuid) -> Option<Batch> {
        self.lock().batches.get(&batch_id).cloned()
    }

    /// Current (queued, running) depth, for monitoring and tests.
    pub fn depth(&self) -> (usize, usize) {
        let state = self.lock();
        (state.waiting.len(), state.running)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().expect("queue lock poisoned")
    }
}

/// Pop and launch waiting units while running-count is under the limit.
/// Capacity check and pop happen under one lock acquisition per unit.
fn dispatch_ready(inner: &Arc<QueueInner>) {
    loop {
        let launch = {
            let mut state = inner.state.lock().expect("queue lock poisoned");
            if state.running >= inner.config.concurrent_limit {
                None
            } else if let Some(id) = state.waiting.pop_front() {
                let unit = state
                    .units
                    .get_mut(&id)
                    .expect("waiting id without unit record");
                unit.status = ExecutionStatus::Running;
                unit.started_at = Some(Utc::now());
                let launch = (id, unit.target.clone(), unit.action.clone());
                state.running += 1;
                Some(launch)
            } else {
                None
            }
        };
        let Some((id, target, action)) = launch else {
            break;
        };
        let inner = Arc::clone(inner);
        tokio::spawn(async move {
            run_unit(inner, id, target, action).await;
        });
    }
}

/// Streaming callbacks wired to the hub for one execution.
struct HubCallbacks {
    hub: StreamingHub,
    execution_id: Uuid,
}

impl StreamingCallbacks for HubCallbacks {
    fn on_stdout(&self, chunk: &str) {
        self.hub.emit_stdout(self.execution_id, chunk);
    }

    fn on_stderr(&self, chunk: &str) {
        self.hub.emit_stderr(self.execution_id, chunk);
    }

    fn on_command(&self, command: &str) {
        self.hub.emit_command(self.execution_id, command);
    }
}

async fn run_unit(inner: Arc<QueueInner>, id: Uuid, target: String, action: ActionSpec) {
    inner.hub.emit_status(id, ExecutionStatus::Running);

    let callbacks: Arc<dyn StreamingCallbacks> = Arc::new(HubCallbacks {
        hub: inner.hub.clone(),
        execution_id: id,
    });
    let outcome = inner.transport.run(id, &target, &action, callbacks).await;

    // A transport error becomes the unit's failed terminal status; it never
    // propagates out of the queue.
    let (status, error) = match &outcome {
        Ok(result) => (result.status, None),
        Err(err) => {
            metrics::counter!("runway_transport_failures_total").increment(1);
            warn!(execution_id = %id, %target, ?err, "transport reported failure");
            (ExecutionStatus::Failed, Some(err.to_string()))
        }
    };

    {
        let mut state = inner.state.lock().expect("queue lock poisoned");
        if let Some(unit) = state.units.get_mut(&id) {
            unit.status = status;
            unit.completed_at = Some(Utc::now());
            unit.error = error;
            state.record_finished(id, inner.config.max_history);
        } else {
            error!(execution_id = %id, "completed unit missing from queue");
        }
        state.running -= 1;
    }
    inner.wakeup.notify_one();

    match outcome {
        Ok(result) => inner.hub.emit_complete(id, &result),
        Err(err) => inner.hub.emit_error(id, &err.to_string()),
    }
}
