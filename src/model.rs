//! Core data model: execution units, batches, actions, and terminal results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of action an execution unit runs against its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Command,
    Task,
    Plan,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActionKind::Command => write!(f, "command"),
            ActionKind::Task => write!(f, "task"),
            ActionKind::Plan => write!(f, "plan"),
        }
    }
}

/// Action descriptor shared by every unit expanded from one batch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: ActionKind,
    /// Command line, task name, or plan name depending on `kind`.
    pub action: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Lifecycle of a single execution unit.
///
/// `queued → running → {succeeded | failed | partial}`; a unit that is
/// cancelled before dispatch goes `queued → cancelled` and never runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Partial,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Succeeded
                | ExecutionStatus::Failed
                | ExecutionStatus::Partial
                | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Queued => "queued",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Partial => "partial",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One action run against one target node.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionUnit {
    pub id: Uuid,
    pub batch_id: Option<Uuid>,
    pub target: String,
    pub action: ActionSpec,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Captured transport error for `failed` units.
    pub error: Option<String>,
}

impl ExecutionUnit {
    pub fn new(batch_id: Option<Uuid>, target: String, action: ActionSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            batch_id,
            target,
            action,
            status: ExecutionStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

/// Correlation record for N units submitted together. A batch is a label,
/// not a unit of execution: each contained unit completes independently.
#[derive(Debug, Clone, Serialize)]
pub struct Batch {
    pub batch_id: Uuid,
    pub execution_ids: Vec<Uuid>,
    pub target_count: usize,
    pub expanded_node_ids: Vec<String>,
}

/// Terminal outcome reported by the transport for one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub output: Option<serde_json::Value>,
}

impl ExecutionResult {
    pub fn succeeded(output: Option<serde_json::Value>) -> Self {
        Self {
            status: ExecutionStatus::Succeeded,
            output,
        }
    }

    pub fn failed(output: Option<serde_json::Value>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            output,
        }
    }
}
