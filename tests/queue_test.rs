//! Admission and dispatch behavior of the execution queue under a live
//! dispatch loop.

use std::sync::Arc;

use runway::test_support::{FailingTransport, ManualTransport, wait_until};
use runway::{
    ActionKind, ActionSpec, CancelOutcome, ExecutionQueue, ExecutionResult, ExecutionStatus,
    ExecutionUnit, QueueConfig, StreamConfig, StreamingHub, SubmitError, TransportExecutor,
};

fn command_unit(target: &str) -> ExecutionUnit {
    ExecutionUnit::new(
        None,
        target.to_string(),
        ActionSpec {
            kind: ActionKind::Command,
            action: "uptime".to_string(),
            parameters: serde_json::Value::Null,
        },
    )
}

fn hub() -> StreamingHub {
    StreamingHub::new(StreamConfig {
        buffer_ms: 5,
        close_grace_ms: 5,
        ..StreamConfig::default()
    })
}

#[tokio::test]
async fn concurrency_limit_holds_and_promotion_follows_completion() {
    let transport = ManualTransport::new();
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 2,
            max_queue_size: 10,
            ..QueueConfig::default()
        },
        Arc::clone(&transport) as Arc<dyn TransportExecutor>,
        hub(),
    );
    let worker = queue.start();

    let ids: Vec<_> = (0..3)
        .map(|i| queue.submit(command_unit(&format!("node-{i}"))).unwrap())
        .collect();

    // Two run immediately, the third stays queued.
    transport.wait_for_started(2).await;
    assert_eq!(queue.depth(), (1, 2));
    assert_eq!(queue.status(ids[0]), Some(ExecutionStatus::Running));
    assert_eq!(queue.status(ids[1]), Some(ExecutionStatus::Running));
    assert_eq!(queue.status(ids[2]), Some(ExecutionStatus::Queued));

    // Completing one running unit promotes the queued one.
    transport.complete(ids[0], ExecutionResult::succeeded(None));
    transport.wait_for_started(3).await;
    wait_until(|| queue.status(ids[0]) == Some(ExecutionStatus::Succeeded)).await;
    assert_eq!(queue.status(ids[2]), Some(ExecutionStatus::Running));
    let (_, running) = queue.depth();
    assert!(running <= 2);

    transport.complete(ids[1], ExecutionResult::succeeded(None));
    transport.complete(ids[2], ExecutionResult::succeeded(None));
    wait_until(|| queue.depth() == (0, 0)).await;
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn queue_full_rejection_leaves_pending_units_untouched() {
    let transport = ManualTransport::new();
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 1,
            max_queue_size: 5,
            ..QueueConfig::default()
        },
        Arc::clone(&transport) as Arc<dyn TransportExecutor>,
        hub(),
    );
    let worker = queue.start();

    let ids: Vec<_> = (0..5)
        .map(|i| queue.submit(command_unit(&format!("node-{i}"))).unwrap())
        .collect();
    transport.wait_for_started(1).await;

    let err = queue.submit(command_unit("node-overflow")).unwrap_err();
    assert!(matches!(err, SubmitError::QueueFull { capacity: 5 }));

    // The original five are unaffected: one running, four still queued.
    assert_eq!(queue.depth(), (4, 1));
    for id in &ids {
        assert!(queue.status(*id).is_some());
    }

    for (i, id) in ids.into_iter().enumerate() {
        transport.wait_for_started(i + 1).await;
        transport.complete(id, ExecutionResult::succeeded(None));
        wait_until(|| queue.status(id) == Some(ExecutionStatus::Succeeded)).await;
    }
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_queued_unit_is_never_dispatched() {
    let transport = ManualTransport::new();
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 1,
            max_queue_size: 10,
            ..QueueConfig::default()
        },
        Arc::clone(&transport) as Arc<dyn TransportExecutor>,
        hub(),
    );
    let worker = queue.start();

    let first = queue.submit(command_unit("node-0")).unwrap();
    let second = queue.submit(command_unit("node-1")).unwrap();
    let third = queue.submit(command_unit("node-2")).unwrap();
    transport.wait_for_started(1).await;

    assert_eq!(
        queue.cancel(second).await.unwrap(),
        CancelOutcome::Cancelled
    );
    assert_eq!(queue.status(second), Some(ExecutionStatus::Cancelled));

    transport.complete(first, ExecutionResult::succeeded(None));
    transport.wait_for_started(2).await;
    transport.complete(third, ExecutionResult::succeeded(None));
    wait_until(|| queue.status(third) == Some(ExecutionStatus::Succeeded)).await;

    // The cancelled unit never reached the transport.
    assert_eq!(transport.started(), vec![first, third]);
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelling_running_unit_delegates_to_transport() {
    let transport = ManualTransport::new();
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 1,
            max_queue_size: 10,
            ..QueueConfig::default()
        },
        Arc::clone(&transport) as Arc<dyn TransportExecutor>,
        hub(),
    );
    let worker = queue.start();

    let id = queue.submit(command_unit("node-0")).unwrap();
    transport.wait_for_started(1).await;
    assert_eq!(queue.cancel(id).await.unwrap(), CancelOutcome::Requested);

    // Best-effort only: the transport may keep running; finish it normally.
    transport.complete(id, ExecutionResult::succeeded(None));
    wait_until(|| queue.status(id) == Some(ExecutionStatus::Succeeded)).await;

    assert!(matches!(
        queue.cancel(id).await.unwrap(),
        CancelOutcome::AlreadyFinished(ExecutionStatus::Succeeded)
    ));
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn transport_error_is_captured_as_failed_status() {
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 1,
            max_queue_size: 10,
            ..QueueConfig::default()
        },
        Arc::new(FailingTransport {
            message: "connection refused".to_string(),
        }),
        hub(),
    );
    let worker = queue.start();

    let id = queue.submit(command_unit("unreachable-node")).unwrap();
    wait_until(|| queue.status(id) == Some(ExecutionStatus::Failed)).await;

    let unit = queue.unit(id).unwrap();
    assert!(unit.error.unwrap().contains("connection refused"));
    assert!(unit.completed_at.is_some());
    assert_eq!(queue.depth(), (0, 0));
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn terminal_history_is_bounded() {
    let transport = ManualTransport::new();
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 1,
            max_queue_size: 10,
            max_history: 2,
        },
        Arc::clone(&transport) as Arc<dyn TransportExecutor>,
        hub(),
    );
    let worker = queue.start();

    let ids: Vec<_> = (0..4)
        .map(|i| queue.submit(command_unit(&format!("node-{i}"))).unwrap())
        .collect();
    for (i, id) in ids.iter().enumerate() {
        transport.wait_for_started(i + 1).await;
        transport.complete(*id, ExecutionResult::succeeded(None));
        wait_until(|| queue.status(*id) == Some(ExecutionStatus::Succeeded)).await;
    }

    // Only the two most recently finished records survive.
    assert!(queue.status(ids[0]).is_none());
    assert!(queue.status(ids[1]).is_none());
    assert_eq!(queue.status(ids[2]), Some(ExecutionStatus::Succeeded));
    assert_eq!(queue.status(ids[3]), Some(ExecutionStatus::Succeeded));
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn batch_record_is_released_with_its_last_unit() {
    let transport = ManualTransport::new();
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 1,
            max_queue_size: 10,
            max_history: 1,
        },
        Arc::clone(&transport) as Arc<dyn TransportExecutor>,
        hub(),
    );
    let worker = queue.start();

    let batch = queue
        .submit_batch(
            vec!["node-a".to_string(), "node-b".to_string()],
            command_unit("x").action,
        )
        .unwrap();
    let (first, second) = (batch.execution_ids[0], batch.execution_ids[1]);

    transport.wait_for_started(1).await;
    transport.complete(first, ExecutionResult::succeeded(None));
    wait_until(|| queue.status(first) == Some(ExecutionStatus::Succeeded)).await;
    transport.wait_for_started(2).await;
    transport.complete(second, ExecutionResult::succeeded(None));
    wait_until(|| queue.status(second) == Some(ExecutionStatus::Succeeded)).await;

    // The first unit's record is evicted, but the batch stays addressable
    // while any of its units remains.
    assert!(queue.status(first).is_none());
    assert!(queue.batch(batch.batch_id).is_some());

    // One more completion evicts the batch's last unit and the batch record.
    let extra = queue.submit(command_unit("node-c")).unwrap();
    transport.wait_for_started(3).await;
    transport.complete(extra, ExecutionResult::succeeded(None));
    wait_until(|| queue.status(extra) == Some(ExecutionStatus::Succeeded)).await;

    assert!(queue.status(second).is_none());
    assert!(queue.batch(batch.batch_id).is_none());
    worker.shutdown().await.unwrap();
}

#[tokio::test]
async fn partial_result_status_is_preserved() {
    let transport = ManualTransport::new();
    let queue = ExecutionQueue::new(
        QueueConfig {
            concurrent_limit: 1,
            max_queue_size: 10,
            ..QueueConfig::default()
        },
        Arc::clone(&transport) as Arc<dyn TransportExecutor>,
        hub(),
    );
    let worker = queue.start();

    let id = queue.submit(command_unit("node-0")).unwrap();
    transport.wait_for_started(1).await;
    transport.complete(
        id,
        ExecutionResult {
            status: ExecutionStatus::Partial,
            output: None,
        },
    );
    wait_until(|| queue.status(id) == Some(ExecutionStatus::Partial)).await;
    worker.shutdown().await.unwrap();
}
