//! HTTP API: batch submission, execution status/cancel, and the live
//! output stream attach endpoint (Server-Sent Events).

use std::sync::Arc;

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, Sse},
    },
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::{StreamExt, wrappers::UnboundedReceiverStream};
use tracing::info;
use uuid::Uuid;

use crate::expander::{ExpandError, TargetExpander};
use crate::model::ActionKind;
use crate::queue::{CancelError, CancelOutcome, ExecutionQueue, SubmitError};
use crate::streaming::{ChannelClosed, Frame, StreamChannel, StreamingHub};

#[derive(Clone)]
pub struct HttpState {
    pub expander: TargetExpander,
    pub queue: ExecutionQueue,
    pub hub: StreamingHub,
}

pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/executions/batch", post(submit_batch))
        .route("/executions/{id}", get(execution_detail))
        .route("/executions/{id}/cancel", post(cancel_execution))
        .route("/executions/{id}/stream", get(stream_execution))
        .route("/batches/{id}", get(batch_detail))
        .route("/healthz", get(healthz))
        .with_state(state)
}

pub async fn run_http_server(listener: TcpListener, state: HttpState) -> AnyResult<()> {
    info!(addr = %listener.local_addr()?, "http server listening");
    let app = create_router(state);
    axum::serve(listener, app).await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    #[serde(default)]
    pub target_node_ids: Vec<String>,
    #[serde(default)]
    pub target_group_ids: Vec<String>,
    #[serde(rename = "type")]
    pub kind: ActionKind,
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub batch_id: Uuid,
    pub execution_ids: Vec<Uuid>,
    pub target_count: usize,
    pub expanded_node_ids: Vec<String>,
}

fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Expand targets and admit one execution unit per target, all-or-nothing.
/// Queue-full is distinguishable (503) from validation failures (400).
async fn submit_batch(
    State(state): State<HttpState>,
    Json(request): Json<BatchRequest>,
) -> Response {
    if request.action.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "action must not be empty");
    }
    if request.target_node_ids.is_empty() && request.target_group_ids.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "at least one target node or group is required",
        );
    }

    let expanded = match state
        .expander
        .expand(&request.target_node_ids, &request.target_group_ids)
    {
        Ok(expanded) => expanded,
        Err(err @ ExpandError::GroupNotFound(_)) => {
            return error_response(StatusCode::BAD_REQUEST, err.to_string());
        }
    };
    if expanded.targets.is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "target selection resolved to zero nodes",
        );
    }

    let action = crate::model::ActionSpec {
        kind: request.kind,
        action: request.action,
        parameters: request.parameters,
    };
    match state.queue.submit_batch(expanded.targets, action) {
        Ok(batch) => Json(BatchResponse {
            batch_id: batch.batch_id,
            execution_ids: batch.execution_ids,
            target_count: batch.target_count,
            expanded_node_ids: batch.expanded_node_ids,
        })
        .into_response(),
        Err(err @ SubmitError::QueueFull { .. }) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
        }
    }
}

async fn execution_detail(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.queue.unit(id) {
        Some(unit) => Json(unit).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("execution not found: {id}")),
    }
}

async fn batch_detail(State(state): State<HttpState>, Path(id): Path<Uuid>) -> Response {
    match state.queue.batch(id) {
        Some(batch) => Json(batch).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("batch not found: {id}")),
    }
}

async fn cancel_execution(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Response {
    match state.queue.cancel(id).await {
        Ok(outcome) => {
            let label = match outcome {
                CancelOutcome::Cancelled => "cancelled",
                CancelOutcome::Requested => "requested",
                CancelOutcome::Unsupported => "unsupported",
                CancelOutcome::AlreadyFinished(_) => "already-finished",
            };
            Json(json!({ "outcome": label, "status": state.queue.status(id) })).into_response()
        }
        Err(err @ CancelError::NotFound(_)) => {
            error_response(StatusCode::NOT_FOUND, err.to_string())
        }
    }
}

/// Adapts an unbounded sender into the hub's channel contract. The send is
/// non-blocking; it fails only when the SSE connection is gone, which is
/// exactly the hub's removal condition.
struct SseChannel {
    tx: mpsc::UnboundedSender<Frame>,
}

impl StreamChannel for SseChannel {
    fn write(&self, frame: &Frame) -> Result<(), ChannelClosed> {
        self.tx.send(frame.clone()).map_err(|_| ChannelClosed)
    }
}

/// Long-lived push channel for one execution's output.
///
/// Execution-level failures arrive as terminal `error` frames on the
/// stream, never as an HTTP failure of this request.
async fn stream_execution(
    State(state): State<HttpState>,
    Path(id): Path<Uuid>,
) -> Response {
    let Some(status) = state.queue.status(id) else {
        return error_response(StatusCode::NOT_FOUND, format!("execution not found: {id}"));
    };
    if status.is_terminal() && !state.hub.is_tracked(id) {
        return error_response(
            StatusCode::GONE,
            format!("execution already finished with status {status}"),
        );
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let channel: Arc<dyn StreamChannel> = Arc::new(SseChannel { tx });
    state.hub.subscribe(id, channel);

    let stream = UnboundedReceiverStream::new(rx).map(|frame| {
        Event::default()
            .event(frame.event.as_str())
            .json_data(&frame)
    });
    Sse::new(stream).into_response()
}

async fn healthz() -> &'static str {
    "ok"
}
