//! Notification events.
//!
//! The engine only publishes; alerting collaborators subscribe and decide
//! what to deliver.  A lagging subscriber loses the oldest events rather
//! than slowing the engine down.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use db::models::{TaskExecutionStatus, WorkflowExecutionStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum EngineEvent {
    WorkflowInstanceStateChanged {
        workflow_instance_id: i64,
        definition_code: i64,
        from: WorkflowExecutionStatus,
        to: WorkflowExecutionStatus,
        at: DateTime<Utc>,
    },
    TaskInstanceStateChanged {
        workflow_instance_id: i64,
        task_instance_id: i64,
        task_code: i64,
        attempt: u32,
        /// `None` when the instance was just created.
        from: Option<TaskExecutionStatus>,
        to: TaskExecutionStatus,
        at: DateTime<Utc>,
    },
    TaskTimeoutWarning {
        workflow_instance_id: i64,
        task_instance_id: i64,
        task_code: i64,
        at: DateTime<Utc>,
    },
    WorkflowTimeoutWarning {
        workflow_instance_id: i64,
        at: DateTime<Utc>,
    },
    /// An operator forced an outcome.
    OverrideApplied {
        workflow_instance_id: i64,
        task_instance_id: Option<i64>,
        action: String,
        at: DateTime<Utc>,
    },
}

/// Fan-out channel for [`EngineEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine.
        if self.sender.send(event).is_err() {
            trace!("Engine event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}
