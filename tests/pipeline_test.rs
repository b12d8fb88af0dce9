//! End-to-end flow: target expansion → batch admission → dispatch →
//! streamed output and terminal frames for every unit in the batch.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;
use uuid::Uuid;

use runway::test_support::{RecordingChannel, wait_until};
use runway::{
    ActionKind, ActionSpec, ExecutionQueue, ExecutionResult, ExecutionStatus, FrameEvent,
    QueueConfig, StaticInventory, StreamChannel, StreamConfig, StreamingCallbacks, StreamingHub,
    TargetExpander, TransportError, TransportExecutor,
};

/// Echoes one stdout line per run, gated so the test can attach
/// subscribers before any unit starts.
struct GatedEchoTransport {
    gate: Semaphore,
}

#[async_trait]
impl TransportExecutor for GatedEchoTransport {
    async fn run(
        &self,
        _execution_id: Uuid,
        target: &str,
        action: &ActionSpec,
        callbacks: Arc<dyn StreamingCallbacks>,
    ) -> Result<ExecutionResult, TransportError> {
        self.gate
            .acquire()
            .await
            .expect("gate closed")
            .forget();
        callbacks.on_command(&action.action);
        callbacks.on_stdout(&format!("ran on {target}\n"));
        Ok(ExecutionResult::succeeded(Some(json!({ "target": target }))))
    }
}

#[tokio::test]
async fn batch_expands_dedupes_and_streams_per_unit() {
    let inventory = StaticInventory::new(HashMap::from([(
        "web".to_string(),
        vec!["web-1".to_string(), "web-2".to_string()],
    )]));
    let expander = TargetExpander::new(Arc::new(inventory));

    let hub = StreamingHub::new(StreamConfig {
        buffer_ms: 5,
        close_grace_ms: 10,
        ..StreamConfig::default()
    });
    let transport = Arc::new(GatedEchoTransport {
        gate: Semaphore::new(0),
    });
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 4,
            max_queue_size: 10,
            ..QueueConfig::default()
        },
        Arc::clone(&transport) as Arc<dyn TransportExecutor>,
        hub.clone(),
    );
    let worker = queue.start();

    // web-1 appears both directly and via the group: exactly one unit.
    let expanded = expander
        .expand(&["web-1".to_string()], &["web".to_string()])
        .unwrap();
    assert_eq!(expanded.targets, vec!["web-1", "web-2"]);

    let action = ActionSpec {
        kind: ActionKind::Command,
        action: "uptime".to_string(),
        parameters: serde_json::Value::Null,
    };
    let batch = queue.submit_batch(expanded.targets, action).unwrap();
    assert_eq!(batch.target_count, 2);
    assert_eq!(batch.execution_ids.len(), 2);
    assert_eq!(queue.batch(batch.batch_id).unwrap().expanded_node_ids.len(), 2);

    // Attach a subscriber per unit, then release the transport.
    let channels: Vec<_> = batch
        .execution_ids
        .iter()
        .map(|id| {
            let channel = RecordingChannel::new();
            hub.subscribe(*id, Arc::clone(&channel) as Arc<dyn StreamChannel>);
            channel
        })
        .collect();
    transport.gate.add_permits(2);

    for id in &batch.execution_ids {
        let id = *id;
        wait_until(|| queue.status(id) == Some(ExecutionStatus::Succeeded)).await;
    }

    for (id, channel) in batch.execution_ids.iter().zip(&channels) {
        wait_until(|| !channel.frames_of(FrameEvent::Complete).is_empty()).await;
        let events = channel.events();
        assert_eq!(events[0], FrameEvent::Start);
        assert!(events.contains(&FrameEvent::Command));
        assert!(events.contains(&FrameEvent::Stdout));
        assert_eq!(*events.last().unwrap(), FrameEvent::Complete);

        // Every frame is tagged with its own execution id.
        for frame in channel.frames() {
            assert_eq!(frame.execution_id, *id);
        }

        let unit = queue.unit(*id).unwrap();
        let stdout = channel.frames_of(FrameEvent::Stdout);
        assert_eq!(
            stdout[0].data,
            json!({ "output": format!("ran on {}\n", unit.target) })
        );
    }

    // Grace delay elapses and per-execution resources are released.
    for id in &batch.execution_ids {
        let id = *id;
        wait_until(|| !hub.is_tracked(id)).await;
    }

    hub.shutdown();
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn units_of_one_batch_complete_independently() {
    let hub = StreamingHub::new(StreamConfig {
        buffer_ms: 5,
        close_grace_ms: 10,
        ..StreamConfig::default()
    });
    let transport = Arc::new(GatedEchoTransport {
        gate: Semaphore::new(0),
    });
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 1,
            max_queue_size: 10,
            ..QueueConfig::default()
        },
        Arc::clone(&transport) as Arc<dyn TransportExecutor>,
        hub.clone(),
    );
    let worker = queue.start();

    let action = ActionSpec {
        kind: ActionKind::Command,
        action: "true".to_string(),
        parameters: serde_json::Value::Null,
    };
    let batch = queue
        .submit_batch(vec!["a".to_string(), "b".to_string()], action)
        .unwrap();
    let (first, second) = (batch.execution_ids[0], batch.execution_ids[1]);

    // Only one permit: the first unit finishes while the second waits.
    transport.gate.add_permits(1);
    wait_until(|| queue.status(first) == Some(ExecutionStatus::Succeeded)).await;
    wait_until(|| queue.status(second) == Some(ExecutionStatus::Running)).await;

    transport.gate.add_permits(1);
    wait_until(|| queue.status(second) == Some(ExecutionStatus::Succeeded)).await;

    hub.shutdown();
    worker.shutdown().await.unwrap();
}
