//! Core domain models: workflow definitions and trigger commands.
//!
//! Definitions are immutable once published; a new edit produces a new
//! version.  Commands are the only way new work enters the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use db::models::{CommandType, FailureStrategy, Priority, TaskDependType, WarningType};

/// Task type tag for tasks that run another workflow definition.
pub const SUB_WORKFLOW_TASK_TYPE: &str = "SUB_PROCESS";

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReleaseState {
    #[default]
    Online,
    Offline,
}

/// How concurrent instances of one definition are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionType {
    /// Any number of concurrent instances.
    #[default]
    Parallel,
    /// At most one active instance; later triggers wait in order.
    Serial,
    /// At most one active instance; later triggers are stopped on arrival.
    SerialDiscard,
}

impl ExecutionType {
    pub fn is_serial(self) -> bool {
        !matches!(self, Self::Parallel)
    }
}

/// Whether a task takes part in runs.  Disabled tasks are bypassed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskFlag {
    #[default]
    Yes,
    No,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeoutStrategy {
    /// Emit a warning, keep running.
    Warn,
    /// Treat the overrun as a failed attempt.
    Fail,
    WarnFail,
}

impl TimeoutStrategy {
    pub fn warns(self) -> bool {
        matches!(self, Self::Warn | Self::WarnFail)
    }

    pub fn fails(self) -> bool {
        matches!(self, Self::Fail | Self::WarnFail)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub seconds: u64,
    pub strategy: TimeoutStrategy,
}

/// A single task template inside a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub code: i64,
    #[serde(default = "first_version")]
    pub version: i32,
    pub name: String,
    /// Opaque to the engine except for [`SUB_WORKFLOW_TASK_TYPE`].
    pub task_type: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub priority: Priority,
    /// Retries after the first attempt.
    #[serde(default)]
    pub retry_times: u32,
    #[serde(default)]
    pub retry_interval_secs: u64,
    #[serde(default)]
    pub timeout: Option<TimeoutPolicy>,
    #[serde(default = "default_worker_group")]
    pub worker_group: String,
    #[serde(default)]
    pub environment_code: Option<i64>,
    #[serde(default)]
    pub flag: TaskFlag,
    #[serde(default)]
    pub task_group_id: Option<i64>,
}

impl TaskDefinition {
    /// Convenience constructor for tests and tooling.
    pub fn new(code: i64, name: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            code,
            version: 1,
            name: name.into(),
            task_type: task_type.into(),
            params: Value::Null,
            priority: Priority::Medium,
            retry_times: 0,
            retry_interval_secs: 0,
            timeout: None,
            worker_group: default_worker_group(),
            environment_code: None,
            flag: TaskFlag::Yes,
            task_group_id: None,
        }
    }

    pub fn with_retries(mut self, retry_times: u32, retry_interval_secs: u64) -> Self {
        self.retry_times = retry_times;
        self.retry_interval_secs = retry_interval_secs;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn in_task_group(mut self, task_group_id: i64) -> Self {
        self.task_group_id = Some(task_group_id);
        self
    }

    pub fn with_timeout(mut self, seconds: u64, strategy: TimeoutStrategy) -> Self {
        self.timeout = Some(TimeoutPolicy { seconds, strategy });
        self
    }

    pub fn disabled(mut self) -> Self {
        self.flag = TaskFlag::No;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.flag == TaskFlag::Yes
    }

    pub fn is_sub_workflow(&self) -> bool {
        self.task_type == SUB_WORKFLOW_TASK_TYPE
    }

    /// Definition code a sub-workflow task starts.
    pub fn sub_workflow_code(&self) -> Option<i64> {
        self.params.get("processDefinitionCode").and_then(Value::as_i64)
    }
}

/// Edge condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConditionType {
    #[default]
    None,
    /// Traversable only when the predecessor reported this branch.
    Branch { branch: String },
    /// Traversable once the predecessor has been finished this long.
    Delay { seconds: u64 },
}

/// Directed edge `(pre_task_code, pre_task_version) → (post_task_code, post_task_version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRelation {
    pub pre_task_code: i64,
    #[serde(default = "first_version")]
    pub pre_task_version: i32,
    pub post_task_code: i64,
    #[serde(default = "first_version")]
    pub post_task_version: i32,
    #[serde(default)]
    pub condition: ConditionType,
}

impl TaskRelation {
    pub fn new(pre_task_code: i64, post_task_code: i64) -> Self {
        Self {
            pre_task_code,
            pre_task_version: 1,
            post_task_code,
            post_task_version: 1,
            condition: ConditionType::None,
        }
    }

    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.condition = ConditionType::Branch { branch: branch.into() };
        self
    }

    pub fn delayed(mut self, seconds: u64) -> Self {
        self.condition = ConditionType::Delay { seconds };
        self
    }
}

/// A versioned DAG template of tasks and dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub code: i64,
    #[serde(default = "first_version")]
    pub version: i32,
    pub name: String,
    #[serde(default)]
    pub project_code: i64,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub relations: Vec<TaskRelation>,
    #[serde(default)]
    pub global_params: Value,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub execution_type: ExecutionType,
    #[serde(default)]
    pub release_state: ReleaseState,
}

impl WorkflowDefinition {
    /// Convenience constructor for tests and tooling.
    pub fn new(code: i64, name: impl Into<String>, tasks: Vec<TaskDefinition>, relations: Vec<TaskRelation>) -> Self {
        Self {
            code,
            version: 1,
            name: name.into(),
            project_code: 0,
            tasks,
            relations,
            global_params: Value::Null,
            tenant: Some("default".to_owned()),
            timeout_minutes: None,
            execution_type: ExecutionType::Parallel,
            release_state: ReleaseState::Online,
        }
    }

    pub fn with_execution_type(mut self, execution_type: ExecutionType) -> Self {
        self.execution_type = execution_type;
        self
    }
}

fn first_version() -> i32 {
    1
}

fn default_worker_group() -> String {
    "default".to_owned()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Backfill dates are processed one at a time or side by side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunMode {
    Serial,
    #[default]
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComplementDependentMode {
    #[default]
    Off,
    /// Date N+1 waits for date N to succeed.
    AllDependent,
}

/// The nominal dates a backfill covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleSpec {
    /// Every `interval_secs` from `start` through `end`, inclusive.
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval_secs: i64,
    },
    /// An explicit list of dates.
    List { dates: Vec<DateTime<Utc>> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplementParams {
    pub schedule: ScheduleSpec,
    #[serde(default)]
    pub order: ExecutionOrder,
    #[serde(default)]
    pub dependent_mode: ComplementDependentMode,
    /// `0` defers to the engine default.
    #[serde(default)]
    pub expected_parallelism: u32,
}

/// What a command asks for.  Instance-targeting variants carry the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    StartProcess,
    Scheduler,
    ComplementData(ComplementParams),
    RepeatRunning { instance_id: i64 },
    RecoverSuspendedProcess { instance_id: i64 },
    RecoverToleranceFaultProcess { instance_id: i64 },
    Pause { instance_id: i64 },
    Stop { instance_id: i64 },
    RecoverFromWaiting { instance_id: i64 },
}

impl CommandKind {
    pub fn command_type(&self) -> CommandType {
        match self {
            Self::StartProcess => CommandType::StartProcess,
            Self::Scheduler => CommandType::Scheduler,
            Self::ComplementData(_) => CommandType::ComplementData,
            Self::RepeatRunning { .. } => CommandType::RepeatRunning,
            Self::RecoverSuspendedProcess { .. } => CommandType::RecoverSuspendedProcess,
            Self::RecoverToleranceFaultProcess { .. } => CommandType::RecoverToleranceFaultProcess,
            Self::Pause { .. } => CommandType::Pause,
            Self::Stop { .. } => CommandType::Stop,
            Self::RecoverFromWaiting { .. } => CommandType::RecoverFromWaiting,
        }
    }
}

/// A durable trigger request, consumed exactly once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub kind: CommandKind,
    pub definition_code: i64,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub warning_type: WarningType,
    #[serde(default)]
    pub warning_group_id: Option<i64>,
    #[serde(default)]
    pub run_mode: RunMode,
    #[serde(default)]
    pub task_depend_type: TaskDependType,
    #[serde(default)]
    pub start_nodes: Vec<i64>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_worker_group")]
    pub worker_group: String,
    /// Falls back to the definition's tenant.
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub environment_code: Option<i64>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub start_params: Value,
    /// Nominal fire time for SCHEDULER commands.
    #[serde(default)]
    pub schedule_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub test_flag: bool,
}

impl Command {
    pub fn new(definition_code: i64, kind: CommandKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            definition_code,
            failure_strategy: FailureStrategy::End,
            warning_type: WarningType::None,
            warning_group_id: None,
            run_mode: RunMode::Parallel,
            task_depend_type: TaskDependType::TaskPost,
            start_nodes: Vec::new(),
            priority: Priority::Medium,
            worker_group: default_worker_group(),
            tenant: None,
            environment_code: None,
            timeout_minutes: None,
            start_params: Value::Null,
            schedule_time: None,
            dry_run: false,
            test_flag: false,
        }
    }

    pub fn start(definition_code: i64) -> Self {
        Self::new(definition_code, CommandKind::StartProcess)
    }

    pub fn complement(definition_code: i64, params: ComplementParams) -> Self {
        Self::new(definition_code, CommandKind::ComplementData(params))
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategy = strategy;
        self
    }

    pub fn with_start_nodes(mut self, start_nodes: Vec<i64>, depend: TaskDependType) -> Self {
        self.start_nodes = start_nodes;
        self.task_depend_type = depend;
        self
    }

    pub fn with_run_mode(mut self, run_mode: RunMode) -> Self {
        self.run_mode = run_mode;
        self
    }

    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    pub fn command_type(&self) -> CommandType {
        self.kind.command_type()
    }
}
