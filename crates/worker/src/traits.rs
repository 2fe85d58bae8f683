//! The `TaskExecutor` trait and the messages that cross it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use db::models::Priority;

use crate::WorkerError;

/// Everything a worker needs to run one attempt of a task instance.
///
/// Defined here (not in the engine) so worker implementations can depend on
/// it without pulling in the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatch {
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub task_code: i64,
    pub task_type: String,
    pub params: Value,
    pub attempt: u32,
    pub priority: Priority,
    pub worker_group: String,
    pub tenant: String,
    pub environment_code: Option<i64>,
    /// Nominal business time of the owning workflow instance.
    pub schedule_time: Option<DateTime<Utc>>,
    /// Merged global and start parameters.
    pub variables: Value,
    pub test_flag: bool,
}

/// State change reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportedState {
    Running,
    Success {
        /// Branch chosen by a branching task, if any.
        branch: Option<String>,
    },
    Failure { message: String },
    Killed,
}

/// Inbound event: `(taskInstanceId, newState, attempt)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskReport {
    pub task_instance_id: i64,
    pub state: ReportedState,
    /// Attempt the report refers to; stale attempts are ignored.
    pub attempt: u32,
    pub host: Option<String>,
    pub at: DateTime<Utc>,
}

impl TaskReport {
    pub fn new(task_instance_id: i64, attempt: u32, state: ReportedState) -> Self {
        Self { task_instance_id, state, attempt, host: None, at: Utc::now() }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }
}

/// The dispatch contract.
///
/// `submit` only acknowledges receipt; the outcome arrives later as a
/// [`TaskReport`].  `kill` is a request: the engine waits for a `Killed`
/// report before treating the task as gone.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn submit(&self, dispatch: TaskDispatch) -> Result<(), WorkerError>;

    async fn kill(&self, task_instance_id: i64) -> Result<(), WorkerError>;
}
