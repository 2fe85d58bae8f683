//! Task group CRUD operations.

use chrono::Utc;

use crate::{
    DbError, DbPool,
    models::{TaskGroup, TaskGroupStatus},
};

const ENTITY: &str = "task group";

/// Create an enabled task group.  Names are unique across the store.
pub fn create_group(
    pool: &DbPool,
    name: &str,
    project_code: i64,
    group_size: u32,
) -> Result<TaskGroup, DbError> {
    let mut table = pool.task_groups.lock();
    if table.values().any(|group| group.name == name) {
        return Err(DbError::DuplicateName(name.to_owned()));
    }

    let row = TaskGroup {
        id: pool.next_id(),
        name: name.to_owned(),
        project_code,
        group_size,
        status: TaskGroupStatus::Enabled,
        description: String::new(),
        create_time: Utc::now(),
    };
    table.insert(row.id, row.clone());
    Ok(row)
}

pub fn get_group(pool: &DbPool, id: i64) -> Result<TaskGroup, DbError> {
    pool.task_groups
        .lock()
        .get(&id)
        .cloned()
        .ok_or_else(|| DbError::not_found(ENTITY, id))
}

pub fn set_status(pool: &DbPool, id: i64, status: TaskGroupStatus) -> Result<TaskGroup, DbError> {
    let mut table = pool.task_groups.lock();
    let row = table.get_mut(&id).ok_or_else(|| DbError::not_found(ENTITY, id))?;
    row.status = status;
    Ok(row.clone())
}

pub fn set_group_size(pool: &DbPool, id: i64, group_size: u32) -> Result<TaskGroup, DbError> {
    let mut table = pool.task_groups.lock();
    let row = table.get_mut(&id).ok_or_else(|| DbError::not_found(ENTITY, id))?;
    row.group_size = group_size;
    Ok(row.clone())
}

pub fn list_groups(pool: &DbPool) -> Vec<TaskGroup> {
    pool.task_groups.lock().values().cloned().collect()
}
