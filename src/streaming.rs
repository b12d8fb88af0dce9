//! Streaming hub: per-execution subscriber registry and output fan-out.
//!
//! The hub decouples output production rate and timing from the number and
//! speed of attached subscribers. Output chunks pass through a bounding
//! pipeline (cumulative byte cap, per-chunk truncation, trailing-debounce
//! buffering) before being delivered as discrete frames; status, command,
//! and terminal frames bypass the buffers. A slow or broken subscriber is
//! dropped on its first failed write and never blocks the rest.

use std::{
    borrow::Cow,
    collections::HashMap,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StreamConfig;
use crate::model::{ExecutionResult, ExecutionStatus};

/// Frame types pushed over the stream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    Start,
    Stdout,
    Stderr,
    Status,
    Command,
    Complete,
    Error,
    Heartbeat,
    OutputLimitReached,
}

impl FrameEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            FrameEvent::Start => "start",
            FrameEvent::Stdout => "stdout",
            FrameEvent::Stderr => "stderr",
            FrameEvent::Status => "status",
            FrameEvent::Command => "command",
            FrameEvent::Complete => "complete",
            FrameEvent::Error => "error",
            FrameEvent::Heartbeat => "heartbeat",
            FrameEvent::OutputLimitReached => "output-limit-reached",
        }
    }
}

/// One discrete frame delivered to subscribers.
///
/// The serialized payload carries `executionId`, `timestamp`, and `data`;
/// the event type travels out-of-band (the SSE `event:` field).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(skip)]
    pub event: FrameEvent,
    pub execution_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: FrameEvent, execution_id: Uuid, data: serde_json::Value) -> Self {
        Self {
            event,
            execution_id,
            timestamp: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Error)]
#[error("subscriber channel closed")]
pub struct ChannelClosed;

/// Narrow subscriber channel contract: one best-effort, non-blocking write
/// per frame. A failed write means the peer is gone; the hub deregisters
/// the subscriber and moves on.
///
/// There is no close callback: a dead channel is only noticed at the next
/// write, so on an otherwise silent execution a disconnected subscriber can
/// linger for up to one heartbeat interval before removal.
pub trait StreamChannel: Send + Sync {
    fn write(&self, frame: &Frame) -> Result<(), ChannelClosed>;
}

struct Subscriber {
    channel: Arc<dyn StreamChannel>,
    connected_at: DateTime<Utc>,
}

/// Which output stream a chunk belongs to. Ordering is guaranteed within a
/// stream, not across streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    fn event(self) -> FrameEvent {
        match self {
            OutputStream::Stdout => FrameEvent::Stdout,
            OutputStream::Stderr => FrameEvent::Stderr,
        }
    }
}

/// Per-(execution, stream) accumulator. At most one pending flush timer.
#[derive(Default)]
struct OutputBuffer {
    chunks: Vec<String>,
    flush_timer: Option<JoinHandle<()>>,
}

impl OutputBuffer {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
    }
}

/// Per-execution output accounting. The limit flag is one-way: once set it
/// never resets for the execution's lifetime.
#[derive(Default)]
struct OutputTracking {
    bytes_emitted: usize,
    limit_reached: bool,
}

#[derive(Default)]
struct ExecutionStreams {
    subscribers: Vec<Subscriber>,
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    tracking: OutputTracking,
    close_timer: Option<JoinHandle<()>>,
}

impl ExecutionStreams {
    fn buffer_mut(&mut self, stream: OutputStream) -> &mut OutputBuffer {
        match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        }
    }

    /// Fan one frame out to every subscriber, dropping any whose channel
    /// write fails. One broken consumer cannot block the rest.
    fn deliver(&mut self, frame: &Frame) {
        let execution_id = frame.execution_id;
        self.subscribers.retain(|sub| match sub.channel.write(frame) {
            Ok(()) => true,
            Err(_) => {
                metrics::counter!("runway_subscribers_dropped_total").increment(1);
                debug!(
                    %execution_id,
                    connected_at = %sub.connected_at,
                    "removing subscriber with closed channel",
                );
                false
            }
        });
    }
}

struct HubInner {
    config: StreamConfig,
    executions: Mutex<HashMap<Uuid, ExecutionStreams>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

/// Subscriber registry and output fan-out, shared by cloning.
#[derive(Clone)]
pub struct StreamingHub {
    inner: Arc<HubInner>,
}

impl StreamingHub {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                executions: Mutex::new(HashMap::new()),
                heartbeat: Mutex::new(None),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, ExecutionStreams>> {
        self.inner.executions.lock().expect("streaming hub lock poisoned")
    }

    /// Attach a subscriber to an execution and push the `start` frame.
    ///
    /// Tracking state for the execution is created on first attach, so
    /// subscribers may connect before the unit produces any output.
    pub fn subscribe(&self, execution_id: Uuid, channel: Arc<dyn StreamChannel>) {
        let frame = Frame::new(
            FrameEvent::Start,
            execution_id,
            json!({ "message": "stream attached" }),
        );
        let mut executions = self.lock();
        if channel.write(&frame).is_err() {
            debug!(%execution_id, "subscriber channel closed before attach completed");
            return;
        }
        executions
            .entry(execution_id)
            .or_default()
            .subscribers
            .push(Subscriber {
                channel,
                connected_at: Utc::now(),
            });
    }

    /// Detach one subscriber. An empty subscriber set does not tear down
    /// the execution's buffers or tracking; the unit may still be running
    /// and later acquire new subscribers.
    pub fn unsubscribe(&self, execution_id: Uuid, channel: &Arc<dyn StreamChannel>) {
        let mut executions = self.lock();
        if let Some(streams) = executions.get_mut(&execution_id) {
            streams
                .subscribers
                .retain(|sub| !Arc::ptr_eq(&sub.channel, channel));
        }
    }

    pub fn subscriber_count(&self, execution_id: Uuid) -> usize {
        self.lock()
            .get(&execution_id)
            .map(|streams| streams.subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_tracked(&self, execution_id: Uuid) -> bool {
        self.lock().contains_key(&execution_id)
    }

    /// Deliver an unbuffered frame to every current subscriber.
    pub fn emit(&self, execution_id: Uuid, event: FrameEvent, data: serde_json::Value) {
        let frame = Frame::new(event, execution_id, data);
        let mut executions = self.lock();
        if let Some(streams) = executions.get_mut(&execution_id) {
            streams.deliver(&frame);
        }
    }

    pub fn emit_status(&self, execution_id: Uuid, status: ExecutionStatus) {
        self.emit(
            execution_id,
            FrameEvent::Status,
            json!({ "status": status }),
        );
    }

    pub fn emit_command(&self, execution_id: Uuid, command: &str) {
        self.emit(
            execution_id,
            FrameEvent::Command,
            json!({ "command": command }),
        );
    }

    pub fn emit_stdout(&self, execution_id: Uuid, chunk: &str) {
        self.emit_output(execution_id, OutputStream::Stdout, chunk);
    }

    pub fn emit_stderr(&self, execution_id: Uuid, chunk: &str) {
        self.emit_output(execution_id, OutputStream::Stderr, chunk);
    }

    /// Output bounding pipeline: cumulative cap, then per-chunk truncation,
    /// then buffered append with a trailing debounce flush.
    fn emit_output(&self, execution_id: Uuid, stream: OutputStream, chunk: &str) {
        let config = self.inner.config.clone();
        let mut executions = self.lock();
        let streams = executions.entry(execution_id).or_default();

        if streams.tracking.limit_reached {
            // One-way flag: no further accounting, no further frames.
            return;
        }
        if streams.tracking.bytes_emitted + chunk.len() > config.max_output_size {
            streams.tracking.limit_reached = true;
            metrics::counter!("runway_output_limited_total").increment(1);
            warn!(
                %execution_id,
                limit = config.max_output_size,
                "execution output limit reached, suppressing further output"
            );
            let frame = Frame::new(
                FrameEvent::OutputLimitReached,
                execution_id,
                json!({
                    "message": format!(
                        "output limit of {} bytes reached, further output suppressed",
                        config.max_output_size
                    ),
                }),
            );
            streams.deliver(&frame);
            return;
        }
        streams.tracking.bytes_emitted += chunk.len();

        let chunk = truncate_chunk(chunk, config.max_line_length);
        let buffer = streams.buffer_mut(stream);
        buffer.chunks.push(chunk.into_owned());

        // Trailing debounce: rapid writes coalesce into one flush after the
        // quiet window, so re-arm the timer on every append.
        buffer.cancel_timer();
        let hub = self.clone();
        buffer.flush_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(config.buffer_window()).await;
            hub.flush_stream(execution_id, stream);
        }));
    }

    /// Join and deliver everything buffered for one stream.
    fn flush_stream(&self, execution_id: Uuid, stream: OutputStream) {
        let mut executions = self.lock();
        let Some(streams) = executions.get_mut(&execution_id) else {
            return;
        };
        let buffer = streams.buffer_mut(stream);
        buffer.flush_timer = None;
        if buffer.chunks.is_empty() {
            return;
        }
        let joined: String = std::mem::take(&mut buffer.chunks).concat();
        let frame = Frame::new(stream.event(), execution_id, json!({ "output": joined }));
        streams.deliver(&frame);
    }

    /// Terminal success/partial path: flush, emit `complete`, close later.
    pub fn emit_complete(&self, execution_id: Uuid, result: &ExecutionResult) {
        self.emit_terminal(
            execution_id,
            Frame::new(
                FrameEvent::Complete,
                execution_id,
                json!({ "status": result.status, "output": result.output }),
            ),
        );
    }

    /// Terminal failure path: flush, emit `error`, close later.
    pub fn emit_error(&self, execution_id: Uuid, error: &str) {
        self.emit_terminal(
            execution_id,
            Frame::new(
                FrameEvent::Error,
                execution_id,
                json!({ "error": error }),
            ),
        );
    }

    fn emit_terminal(&self, execution_id: Uuid, frame: Frame) {
        let mut executions = self.lock();
        let Some(streams) = executions.get_mut(&execution_id) else {
            return;
        };

        // Force-flush both buffers past the debounce so no output is lost
        // behind the terminal frame.
        for stream in [OutputStream::Stdout, OutputStream::Stderr] {
            let buffer = streams.buffer_mut(stream);
            buffer.cancel_timer();
            if !buffer.chunks.is_empty() {
                let joined: String = std::mem::take(&mut buffer.chunks).concat();
                let flushed =
                    Frame::new(stream.event(), execution_id, json!({ "output": joined }));
                streams.deliver(&flushed);
            }
        }

        streams.deliver(&frame);

        // Grace delay before closing channels so in-flight frames are not
        // dropped client-side.
        if let Some(timer) = streams.close_timer.take() {
            timer.abort();
        }
        let hub = self.clone();
        let grace = self.inner.config.close_grace();
        streams.close_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            hub.teardown(execution_id);
        }));
    }

    /// Release the execution's buffers, tracking, and subscriber set.
    /// Dropping the subscribers closes their channels.
    fn teardown(&self, execution_id: Uuid) {
        let mut executions = self.lock();
        if let Some(mut streams) = executions.remove(&execution_id) {
            streams.stdout.cancel_timer();
            streams.stderr.cancel_timer();
            debug!(%execution_id, "execution stream torn down");
        }
    }

    /// Start the periodic liveness pulse. Idle intermediaries (proxies,
    /// load balancers) will otherwise drop long-lived connections that see
    /// no traffic between output bursts.
    pub fn start_heartbeat(&self) {
        let hub = self.clone();
        let period = self.inner.config.heartbeat_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; skip it so the first
            // pulse lands one full period after startup.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                hub.heartbeat_tick();
            }
        });
        let mut slot = self
            .inner
            .heartbeat
            .lock()
            .expect("heartbeat lock poisoned");
        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    fn heartbeat_tick(&self) {
        let mut executions = self.lock();
        for (execution_id, streams) in executions.iter_mut() {
            let frame = Frame::new(
                FrameEvent::Heartbeat,
                *execution_id,
                json!({ "alive": true }),
            );
            streams.deliver(&frame);
        }
    }

    /// Global cleanup at process shutdown: stop the heartbeat and tear
    /// down every tracked execution's subscribers, buffers, and timers.
    pub fn shutdown(&self) {
        {
            let mut slot = self
                .inner
                .heartbeat
                .lock()
                .expect("heartbeat lock poisoned");
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
        let mut executions = self.lock();
        for (_, mut streams) in executions.drain() {
            streams.stdout.cancel_timer();
            streams.stderr.cancel_timer();
            if let Some(timer) = streams.close_timer.take() {
                timer.abort();
            }
        }
    }
}

/// Cap a single chunk at `max_line_length` characters, annotating how many
/// were elided. Chunks at or under the cap pass through unchanged.
pub fn truncate_chunk(chunk: &str, max_line_length: usize) -> Cow<'_, str> {
    let char_count = chunk.chars().count();
    if char_count <= max_line_length {
        return Cow::Borrowed(chunk);
    }
    let boundary = chunk
        .char_indices()
        .nth(max_line_length)
        .map(|(idx, _)| idx)
        .unwrap_or(chunk.len());
    let elided = char_count - max_line_length;
    Cow::Owned(format!(
        "{}... [truncated {elided} characters]",
        &chunk[..boundary]
    ))
}
