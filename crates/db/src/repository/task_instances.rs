//! Task instance persistence.

use crate::{
    DbError, DbPool,
    models::{TaskExecutionStatus, TaskInstance},
};

const ENTITY: &str = "task instance";

/// Insert a new task instance; the row's `id` is assigned by the store.
pub fn insert_task_instance(pool: &DbPool, mut row: TaskInstance) -> Result<TaskInstance, DbError> {
    row.id = pool.next_id();
    pool.task_instances.lock().insert(row.id, row.clone());
    Ok(row)
}

pub fn get_task_instance(pool: &DbPool, id: i64) -> Result<TaskInstance, DbError> {
    pool.task_instances
        .lock()
        .get(&id)
        .cloned()
        .ok_or_else(|| DbError::not_found(ENTITY, id))
}

pub fn update_task_instance(pool: &DbPool, row: &TaskInstance) -> Result<(), DbError> {
    let mut table = pool.task_instances.lock();
    let slot = table.get_mut(&row.id).ok_or_else(|| DbError::not_found(ENTITY, row.id))?;
    *slot = row.clone();
    Ok(())
}

/// Move `id` to `new` only if its current state equals `expected`.
pub fn compare_and_set_state(
    pool: &DbPool,
    id: i64,
    expected: TaskExecutionStatus,
    new: TaskExecutionStatus,
) -> Result<TaskInstance, DbError> {
    let mut table = pool.task_instances.lock();
    let row = table.get_mut(&id).ok_or_else(|| DbError::not_found(ENTITY, id))?;
    if row.state != expected {
        return Err(DbError::StaleState {
            entity: ENTITY,
            id: id.to_string(),
            expected: expected.to_string(),
            actual: row.state.to_string(),
        });
    }
    row.state = new;
    Ok(row.clone())
}

/// Every task instance of a workflow instance, in creation order.
pub fn list_by_workflow_instance(pool: &DbPool, workflow_instance_id: i64) -> Vec<TaskInstance> {
    pool.task_instances
        .lock()
        .values()
        .filter(|row| row.workflow_instance_id == workflow_instance_id)
        .cloned()
        .collect()
}
