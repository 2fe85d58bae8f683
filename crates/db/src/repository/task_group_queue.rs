//! Task group queue entries.
//!
//! Callers are expected to serialise access per group (the admission
//! controller holds a per-group lock); these functions only guarantee that
//! each individual update is atomic.

use chrono::Utc;

use crate::{
    DbError, DbPool,
    models::{Priority, TaskGroupQueue, TaskGroupQueueStatus},
};

const ENTITY: &str = "task group queue entry";

/// Insert a queue entry in the given status.
pub fn insert_entry(
    pool: &DbPool,
    task_group_id: i64,
    task_instance_id: i64,
    workflow_instance_id: i64,
    priority: Priority,
    status: TaskGroupQueueStatus,
) -> Result<TaskGroupQueue, DbError> {
    let now = Utc::now();
    let row = TaskGroupQueue {
        id: pool.next_id(),
        task_instance_id,
        workflow_instance_id,
        task_group_id,
        priority,
        status,
        enqueue_time: now,
        update_time: now,
    };
    pool.task_group_queue.lock().insert(row.id, row.clone());
    Ok(row)
}

pub fn get_entry(pool: &DbPool, id: i64) -> Result<TaskGroupQueue, DbError> {
    pool.task_group_queue
        .lock()
        .get(&id)
        .cloned()
        .ok_or_else(|| DbError::not_found(ENTITY, id))
}

/// Move an entry to `new` only if its current status equals `expected`.
pub fn compare_and_set_status(
    pool: &DbPool,
    id: i64,
    expected: TaskGroupQueueStatus,
    new: TaskGroupQueueStatus,
) -> Result<TaskGroupQueue, DbError> {
    let mut table = pool.task_group_queue.lock();
    let row = table.get_mut(&id).ok_or_else(|| DbError::not_found(ENTITY, id))?;
    if row.status != expected {
        return Err(DbError::StaleState {
            entity: ENTITY,
            id: id.to_string(),
            expected: expected.to_string(),
            actual: row.status.to_string(),
        });
    }
    row.status = new;
    row.update_time = Utc::now();
    Ok(row.clone())
}

/// Number of RUNNING entries for a group.
pub fn count_running(pool: &DbPool, task_group_id: i64) -> usize {
    pool.task_group_queue
        .lock()
        .values()
        .filter(|row| row.task_group_id == task_group_id && row.status == TaskGroupQueueStatus::Running)
        .count()
}

/// RUNNING entries for a group.
pub fn running_entries(pool: &DbPool, task_group_id: i64) -> Vec<TaskGroupQueue> {
    pool.task_group_queue
        .lock()
        .values()
        .filter(|row| row.task_group_id == task_group_id && row.status == TaskGroupQueueStatus::Running)
        .cloned()
        .collect()
}

/// WAITING entries for a group in promotion order: priority descending,
/// enqueue time ascending, then id ascending.
pub fn waiting_in_order(pool: &DbPool, task_group_id: i64) -> Vec<TaskGroupQueue> {
    let mut waiting: Vec<TaskGroupQueue> = pool
        .task_group_queue
        .lock()
        .values()
        .filter(|row| row.task_group_id == task_group_id && row.status == TaskGroupQueueStatus::Waiting)
        .cloned()
        .collect();

    waiting.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.enqueue_time.cmp(&b.enqueue_time))
            .then(a.id.cmp(&b.id))
    });
    waiting
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::create_pool;

    #[test]
    fn waiting_entries_sort_by_priority_then_arrival() {
        let pool = create_pool();
        let low = insert_entry(&pool, 1, 10, 100, Priority::Low, TaskGroupQueueStatus::Waiting).unwrap();
        let high = insert_entry(&pool, 1, 11, 100, Priority::High, TaskGroupQueueStatus::Waiting).unwrap();
        let low_later = insert_entry(&pool, 1, 12, 100, Priority::Low, TaskGroupQueueStatus::Waiting).unwrap();
        insert_entry(&pool, 2, 13, 100, Priority::Highest, TaskGroupQueueStatus::Waiting).unwrap();

        let order: Vec<i64> = waiting_in_order(&pool, 1).iter().map(|e| e.id).collect();
        assert_eq!(order, vec![high.id, low.id, low_later.id]);
    }

    #[test]
    fn compare_and_set_rejects_stale_status() {
        let pool = create_pool();
        let entry = insert_entry(&pool, 1, 10, 100, Priority::Medium, TaskGroupQueueStatus::Running).unwrap();

        compare_and_set_status(&pool, entry.id, TaskGroupQueueStatus::Running, TaskGroupQueueStatus::Released)
            .expect("first release wins");
        let second = compare_and_set_status(
            &pool,
            entry.id,
            TaskGroupQueueStatus::Running,
            TaskGroupQueueStatus::Released,
        );
        assert!(matches!(second, Err(DbError::StaleState { .. })));
        assert_eq!(count_running(&pool, 1), 0);
    }
}
