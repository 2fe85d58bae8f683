//! Row structs that map 1-to-1 onto persisted tables.
//!
//! These are *persistence* models; they carry no transition logic.  The
//! state machines that mutate them live in the `engine` crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Implements `Display` and `FromStr` for a fieldless enum using the
/// SCREAMING_SNAKE_CASE names the rows are stored with.
macro_rules! stored_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$variant => write!(f, $text),)+
                }
            }
        }

        impl std::str::FromStr for $ty {
            type Err = String;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(concat!("unknown ", stringify!($ty), ": {}"), other)),
                }
            }
        }
    };
}

// ---------------------------------------------------------------------------
// Shared run parameters
// ---------------------------------------------------------------------------

/// Scheduling priority.  Ordered so that `Highest > Lowest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Lowest,
    Low,
    #[default]
    Medium,
    High,
    Highest,
}

stored_enum!(Priority {
    Lowest => "LOWEST",
    Low => "LOW",
    Medium => "MEDIUM",
    High => "HIGH",
    Highest => "HIGHEST",
});

/// What happens to sibling branches after a task fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStrategy {
    Continue,
    #[default]
    End,
}

stored_enum!(FailureStrategy { Continue => "CONTINUE", End => "END" });

/// Which outcomes the alerting collaborator should be told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WarningType {
    #[default]
    None,
    Success,
    Failure,
    All,
}

stored_enum!(WarningType {
    None => "NONE",
    Success => "SUCCESS",
    Failure => "FAILURE",
    All => "ALL",
});

/// How far beyond the declared start nodes a run reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskDependType {
    /// Only the start nodes; predecessor state is ignored.
    TaskOnly,
    /// Start nodes plus every upstream task.
    TaskPre,
    /// Start nodes plus every downstream task.
    #[default]
    TaskPost,
}

stored_enum!(TaskDependType {
    TaskOnly => "TASK_ONLY",
    TaskPre => "TASK_PRE",
    TaskPost => "TASK_POST",
});

/// The trigger kind a workflow instance was created by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    StartProcess,
    Scheduler,
    ComplementData,
    RepeatRunning,
    RecoverSuspendedProcess,
    RecoverToleranceFaultProcess,
    Pause,
    Stop,
    RecoverFromWaiting,
}

stored_enum!(CommandType {
    StartProcess => "START_PROCESS",
    Scheduler => "SCHEDULER",
    ComplementData => "COMPLEMENT_DATA",
    RepeatRunning => "REPEAT_RUNNING",
    RecoverSuspendedProcess => "RECOVER_SUSPENDED_PROCESS",
    RecoverToleranceFaultProcess => "RECOVER_TOLERANCE_FAULT_PROCESS",
    Pause => "PAUSE",
    Stop => "STOP",
    RecoverFromWaiting => "RECOVER_FROM_WAITING",
});

// ---------------------------------------------------------------------------
// workflow_instance
// ---------------------------------------------------------------------------

/// Lifecycle of one DAG run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowExecutionStatus {
    SubmittedSuccess,
    RunningExecution,
    /// Pause requested; in-flight tasks are still finishing.
    ReadyPause,
    Pause,
    /// Stop requested; waiting for KILLED acknowledgements.
    ReadyStop,
    Stop,
    Failure,
    Success,
    Kill,
    /// Queued behind an active instance of a SERIAL definition.
    WaitingThread,
}

stored_enum!(WorkflowExecutionStatus {
    SubmittedSuccess => "SUBMITTED_SUCCESS",
    RunningExecution => "RUNNING_EXECUTION",
    ReadyPause => "READY_PAUSE",
    Pause => "PAUSE",
    ReadyStop => "READY_STOP",
    Stop => "STOP",
    Failure => "FAILURE",
    Success => "SUCCESS",
    Kill => "KILL",
    WaitingThread => "WAITING_THREAD",
});

impl WorkflowExecutionStatus {
    /// Terminal states never change again (except through an explicit
    /// override or a repeat-running command).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stop | Self::Failure | Self::Success | Self::Kill)
    }

    /// States that occupy the SERIAL slot of their definition.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::SubmittedSuccess | Self::RunningExecution | Self::ReadyPause | Self::ReadyStop
        )
    }
}

/// A persisted workflow instance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: i64,
    pub definition_code: i64,
    pub definition_version: i32,
    pub name: String,
    pub state: WorkflowExecutionStatus,
    pub command_type: CommandType,
    /// Nominal business time; distinct from `start_time`.
    pub schedule_time: Option<DateTime<Utc>>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub failure_strategy: FailureStrategy,
    pub warning_type: WarningType,
    pub warning_group_id: Option<i64>,
    pub priority: Priority,
    pub worker_group: String,
    pub tenant: String,
    pub environment_code: Option<i64>,
    pub timeout_minutes: Option<u32>,
    pub start_params: serde_json::Value,
    /// Task codes the run starts from; empty means the whole graph.
    pub start_nodes: Vec<i64>,
    pub task_depend_type: TaskDependType,
    pub parent_instance_id: Option<i64>,
    pub parent_task_instance_id: Option<i64>,
    /// Backfill command this instance belongs to, if any.
    pub complement_id: Option<Uuid>,
    pub dry_run: bool,
    pub test_flag: bool,
    /// Id of the first task instance that failed terminally.
    pub first_failed_task: Option<i64>,
    /// Number of times the instance has been (re-)run.
    pub run_times: u32,
    /// Set when an operator forced the instance to SUCCESS.
    pub forced_success: bool,
    pub host: Option<String>,
}

// ---------------------------------------------------------------------------
// task_instance
// ---------------------------------------------------------------------------

/// Lifecycle of one task run inside a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStatus {
    Submitted,
    Dispatched,
    Running,
    Success,
    Failure,
    Killed,
    Paused,
    ForcedSuccess,
}

stored_enum!(TaskExecutionStatus {
    Submitted => "SUBMITTED",
    Dispatched => "DISPATCHED",
    Running => "RUNNING",
    Success => "SUCCESS",
    Failure => "FAILURE",
    Killed => "KILLED",
    Paused => "PAUSED",
    ForcedSuccess => "FORCED_SUCCESS",
});

impl TaskExecutionStatus {
    pub fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::ForcedSuccess)
    }

    /// Handed to a worker and not yet reported back.
    pub fn is_in_flight(self) -> bool {
        matches!(self, Self::Dispatched | Self::Running)
    }
}

/// A persisted task instance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: i64,
    pub workflow_instance_id: i64,
    pub task_code: i64,
    pub task_version: i32,
    pub name: String,
    pub task_type: String,
    pub state: TaskExecutionStatus,
    /// 1-based attempt counter.
    pub attempt: u32,
    pub priority: Priority,
    pub worker_group: String,
    pub host: Option<String>,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub task_group_id: Option<i64>,
    pub task_group_queue_id: Option<i64>,
    /// Latched once the queue entry has been released.
    pub queue_released: bool,
    /// Branch chosen by a branching task; drives conditional edges.
    pub branch: Option<String>,
    pub error_message: Option<String>,
}

// ---------------------------------------------------------------------------
// task_group / task_group_queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskGroupStatus {
    #[default]
    Enabled,
    Disabled,
}

stored_enum!(TaskGroupStatus { Enabled => "ENABLED", Disabled => "DISABLED" });

/// A named, size-bounded admission gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: i64,
    pub name: String,
    pub project_code: i64,
    pub group_size: u32,
    pub status: TaskGroupStatus,
    pub description: String,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskGroupQueueStatus {
    Waiting,
    Running,
    Released,
    ForceReleased,
}

stored_enum!(TaskGroupQueueStatus {
    Waiting => "WAITING",
    Running => "RUNNING",
    Released => "RELEASED",
    ForceReleased => "FORCE_RELEASED",
});

impl TaskGroupQueueStatus {
    pub fn is_released(self) -> bool {
        matches!(self, Self::Released | Self::ForceReleased)
    }
}

/// One task instance's claim on a task group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskGroupQueue {
    pub id: i64,
    pub task_instance_id: i64,
    pub workflow_instance_id: i64,
    pub task_group_id: i64,
    pub priority: Priority,
    pub status: TaskGroupQueueStatus,
    pub enqueue_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// command
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

stored_enum!(CommandStatus {
    Pending => "PENDING",
    Processing => "PROCESSING",
    Processed => "PROCESSED",
    Failed => "FAILED",
});

/// A queued trigger request.  `payload` is the serialised engine command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRow {
    pub id: Uuid,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
