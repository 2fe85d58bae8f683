//! `MockWorker`: a test double for `TaskExecutor`.
//!
//! Records every dispatch and kill request so tests can assert on them and
//! then feed hand-written `TaskReport`s back into the engine.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{TaskDispatch, TaskExecutor, WorkerError};

/// Behaviour injected into `MockWorker` at construction time.
#[derive(Debug, Clone)]
pub enum MockBehaviour {
    /// Acknowledge every dispatch.
    Accept,
    /// Reject every dispatch with the given reason.
    Reject(String),
}

/// A mock worker that records calls and never reports on its own.
#[derive(Debug, Clone)]
pub struct MockWorker {
    pub behaviour: MockBehaviour,
    /// All dispatches seen (in call order).
    pub submitted: Arc<Mutex<Vec<TaskDispatch>>>,
    /// All kill requests seen (in call order).
    pub killed: Arc<Mutex<Vec<i64>>>,
}

impl MockWorker {
    /// A worker that accepts everything.
    pub fn accepting() -> Self {
        Self::with(MockBehaviour::Accept)
    }

    /// A worker that rejects everything.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self::with(MockBehaviour::Reject(reason.into()))
    }

    fn with(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour,
            submitted: Arc::new(Mutex::new(Vec::new())),
            killed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn submit_count(&self) -> usize {
        self.submitted.lock().len()
    }

    /// Task codes dispatched so far, in order.
    pub fn submitted_codes(&self) -> Vec<i64> {
        self.submitted.lock().iter().map(|d| d.task_code).collect()
    }

    /// The most recent dispatch for a task code.
    pub fn last_dispatch_of(&self, task_code: i64) -> Option<TaskDispatch> {
        self.submitted.lock().iter().rev().find(|d| d.task_code == task_code).cloned()
    }

    pub fn kill_requests(&self) -> Vec<i64> {
        self.killed.lock().clone()
    }
}

#[async_trait]
impl TaskExecutor for MockWorker {
    async fn submit(&self, dispatch: TaskDispatch) -> Result<(), WorkerError> {
        match &self.behaviour {
            MockBehaviour::Accept => {
                self.submitted.lock().push(dispatch);
                Ok(())
            }
            MockBehaviour::Reject(reason) => Err(WorkerError::Rejected(reason.clone())),
        }
    }

    async fn kill(&self, task_instance_id: i64) -> Result<(), WorkerError> {
        self.killed.lock().push(task_instance_id);
        Ok(())
    }
}
