//! Local shell transport.
//!
//! Runs command actions as local child processes, streaming stdout and
//! stderr lines through the hub callbacks as they arrive. This is the
//! composition-root default; production deployments swap in a remote
//! transport behind the same [`TransportExecutor`] contract. Task and plan
//! actions need an orchestration backend and are rejected here.

use std::{collections::HashMap, process::Stdio, sync::Arc};

use async_trait::async_trait;
use serde_json::json;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{Mutex, oneshot},
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{ActionKind, ActionSpec, ExecutionResult};
use crate::transport::{CancelSupport, StreamingCallbacks, TransportError, TransportExecutor};

#[derive(Default)]
pub struct ShellTransport {
    /// Kill switches for in-flight children, keyed by execution id.
    running: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
}

impl ShellTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TransportExecutor for ShellTransport {
    async fn run(
        &self,
        execution_id: Uuid,
        target: &str,
        action: &ActionSpec,
        callbacks: Arc<dyn StreamingCallbacks>,
    ) -> Result<ExecutionResult, TransportError> {
        if action.kind != ActionKind::Command {
            return Err(TransportError::UnsupportedAction(action.kind));
        }

        callbacks.on_command(&action.action);
        debug!(%execution_id, %target, command = %action.action, "spawning shell command");

        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&action.action)
            .env("RUNWAY_TARGET", target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Failed("child stdout missing".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Failed("child stderr missing".to_string()))?;

        let out_cb = Arc::clone(&callbacks);
        let stdout_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                out_cb.on_stdout(&format!("{line}\n"));
            }
        });
        let err_cb = Arc::clone(&callbacks);
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                err_cb.on_stderr(&format!("{line}\n"));
            }
        });

        let (kill_tx, kill_rx) = oneshot::channel();
        self.running.lock().await.insert(execution_id, kill_tx);

        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_rx => {
                warn!(%execution_id, "kill requested, terminating child");
                let _ = child.start_kill();
                child.wait().await
            }
        };
        self.running.lock().await.remove(&execution_id);

        // Drain any output still buffered in the pipes.
        let _ = stdout_reader.await;
        let _ = stderr_reader.await;

        let status = status?;
        let exit_code = status.code();
        let output = Some(json!({ "exitCode": exit_code }));
        if status.success() {
            Ok(ExecutionResult::succeeded(output))
        } else {
            Ok(ExecutionResult::failed(output))
        }
    }

    async fn cancel(&self, execution_id: Uuid) -> CancelSupport {
        match self.running.lock().await.remove(&execution_id) {
            Some(kill_tx) => {
                let _ = kill_tx.send(());
                CancelSupport::Requested
            }
            None => CancelSupport::Unsupported,
        }
    }
}
