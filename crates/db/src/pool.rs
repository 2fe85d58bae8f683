//! The shared store handle.
//!
//! The relational engine is an external collaborator; this crate keeps the
//! same table shapes in memory so the engine can run and be tested without
//! one.  Each table sits behind its own lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::models::{CommandRow, TaskGroup, TaskGroupQueue, TaskInstance, WorkflowInstance};

/// Shared handle used across the whole application.
pub type DbPool = Arc<Store>;

/// In-memory tables keyed by primary key.
#[derive(Debug, Default)]
pub struct Store {
    sequence: AtomicI64,
    pub(crate) workflow_instances: Mutex<BTreeMap<i64, WorkflowInstance>>,
    pub(crate) task_instances: Mutex<BTreeMap<i64, TaskInstance>>,
    pub(crate) task_groups: Mutex<BTreeMap<i64, TaskGroup>>,
    pub(crate) task_group_queue: Mutex<BTreeMap<i64, TaskGroupQueue>>,
    pub(crate) commands: Mutex<Vec<CommandRow>>,
}

impl Store {
    /// Next value of the store-wide id sequence.  Strictly increasing, so
    /// ids double as insertion order.
    pub(crate) fn next_id(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// Create a new, empty store.
pub fn create_pool() -> DbPool {
    info!("Creating in-memory store");
    Arc::new(Store::default())
}
