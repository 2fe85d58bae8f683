//! Engine-level error types.

use thiserror::Error;

/// Rejections raised before any workflow instance is created.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Depth-first search found a back edge; `task_code` lies on the cycle.
    #[error("workflow graph contains a cycle through task {task_code}")]
    GraphCycle { task_code: i64 },

    #[error("duplicate task code: {0}")]
    DuplicateTask(i64),

    /// A relation references a task (or task version) that doesn't exist.
    #[error("relation references unknown task {task_code} v{version} ({side} side)")]
    UnknownTaskReference {
        task_code: i64,
        version: i32,
        side: &'static str,
    },

    #[error("start node {0} is not part of the workflow")]
    UnknownStartTask(i64),

    #[error("no tenant configured for the run")]
    MissingTenant,

    #[error("workflow definition {0} not found")]
    DefinitionNotFound(i64),

    #[error("workflow definition {0} has no version {1}")]
    DefinitionVersionNotFound(i64, i32),

    #[error("workflow definition {0} is offline")]
    DefinitionOffline(i64),

    #[error("schedule range yields no dates")]
    EmptyScheduleRange,

    #[error("schedule interval must be positive")]
    InvalidInterval,
}

/// Errors produced by the engine.
///
/// Task failures are *not* errors: they surface as task and workflow state.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// The target is in a state that doesn't allow the requested action.
    #[error("cannot {action} {entity} {id} in state {state}")]
    InvalidTransition {
        entity: &'static str,
        id: i64,
        state: String,
        action: &'static str,
    },

    #[error("workflow instance {0} not found")]
    InstanceNotFound(i64),

    #[error("task instance {0} not found")]
    TaskInstanceNotFound(i64),

    #[error("task group {0} not found")]
    TaskGroupNotFound(i64),

    /// Fatal for the group: RUNNING entries exceeded capacity.
    #[error("task group {group_id} has {running} running entries, capacity {capacity}")]
    CapacityExceeded {
        group_id: i64,
        running: usize,
        capacity: u32,
    },

    /// The group tripped the capacity invariant and awaits an operator.
    #[error("task group {0} is quarantined until cleared")]
    GroupQuarantined(i64),

    #[error("task group {group_id} capacity {requested} is below its {running} running entries")]
    CapacityInUse {
        group_id: i64,
        running: usize,
        requested: u32,
    },

    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("worker error: {0}")]
    Worker(#[from] worker::WorkerError),

    #[error("command payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("workflow instance {id} still {state} after {waited_ms}ms")]
    WaitTimedOut { id: i64, state: String, waited_ms: u128 },

    /// The instance's driver went away before answering.
    #[error("workflow instance {0} is no longer driven")]
    DriverGone(i64),
}

impl EngineError {
    pub(crate) fn invalid(
        entity: &'static str,
        id: i64,
        state: impl ToString,
        action: &'static str,
    ) -> Self {
        Self::InvalidTransition { entity, id, state: state.to_string(), action }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
