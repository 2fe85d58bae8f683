//! Workflow instance persistence.

use crate::{
    DbError, DbPool,
    models::{WorkflowExecutionStatus, WorkflowInstance},
};

const ENTITY: &str = "workflow instance";

/// Insert a new instance; the row's `id` is assigned by the store.
pub fn insert_instance(pool: &DbPool, mut row: WorkflowInstance) -> Result<WorkflowInstance, DbError> {
    row.id = pool.next_id();
    pool.workflow_instances.lock().insert(row.id, row.clone());
    Ok(row)
}

/// Fetch a single instance by primary key.
pub fn get_instance(pool: &DbPool, id: i64) -> Result<WorkflowInstance, DbError> {
    pool.workflow_instances
        .lock()
        .get(&id)
        .cloned()
        .ok_or_else(|| DbError::not_found(ENTITY, id))
}

/// Overwrite an existing instance row.
pub fn update_instance(pool: &DbPool, row: &WorkflowInstance) -> Result<(), DbError> {
    let mut table = pool.workflow_instances.lock();
    let slot = table.get_mut(&row.id).ok_or_else(|| DbError::not_found(ENTITY, row.id))?;
    *slot = row.clone();
    Ok(())
}

/// Move `id` to `new` only if its current state equals `expected`.
pub fn compare_and_set_state(
    pool: &DbPool,
    id: i64,
    expected: WorkflowExecutionStatus,
    new: WorkflowExecutionStatus,
) -> Result<WorkflowInstance, DbError> {
    let mut table = pool.workflow_instances.lock();
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

/// All instances of a definition, oldest first.
pub fn list_by_definition(pool: &DbPool, definition_code: i64) -> Vec<WorkflowInstance> {
    pool.workflow_instances
        .lock()
        .values()
        .filter(|row| row.definition_code == definition_code)
        .cloned()
        .collect()
}

/// Instances of a definition in one of `states`, oldest first.
pub fn list_by_state(
    pool: &DbPool,
    definition_code: i64,
    states: &[WorkflowExecutionStatus],
) -> Vec<WorkflowInstance> {
    pool.workflow_instances
        .lock()
        .values()
        .filter(|row| row.definition_code == definition_code && states.contains(&row.state))
        .cloned()
        .collect()
}

/// Every instance not yet in a terminal state, oldest first.
pub fn list_unfinished(pool: &DbPool) -> Vec<WorkflowInstance> {
    pool.workflow_instances
        .lock()
        .values()
        .filter(|row| !row.state.is_terminal())
        .cloned()
        .collect()
}
