//! Task group admission control.
//!
//! A task group is a named semaphore with a priority-ordered wait queue.
//! Every operation touching one group runs under that group's lock, which is
//! the only hard mutual-exclusion boundary in the engine; different groups
//! never contend with each other.
//!
//! Promotion order is priority descending, then enqueue time ascending, then
//! queue entry id ascending.  Entry ids come from a strictly increasing
//! sequence, so two entries with equal priority and equal timestamps are
//! promoted in the order they were created.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use db::models::{Priority, TaskGroup, TaskGroupQueue, TaskGroupQueueStatus, TaskGroupStatus};
use db::repository::{task_group_queue as queue_repo, task_groups as group_repo};
use db::{DbError, DbPool};

use crate::error::{EngineError, EngineResult};

/// Result of [`AdmissionControllerRegistry::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// A RUNNING entry was created; the task may dispatch now.
    Granted(TaskGroupQueue),
    /// A WAITING entry was created; the task waits for a promotion.
    Queued(TaskGroupQueue),
}

impl Admission {
    pub fn entry(&self) -> &TaskGroupQueue {
        match self {
            Self::Granted(entry) | Self::Queued(entry) => entry,
        }
    }
}

/// Point-in-time view of one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSnapshot {
    pub group: TaskGroup,
    pub running: usize,
    pub waiting: usize,
    pub quarantined: bool,
}

#[derive(Debug, Default)]
struct GroupSlot {
    /// Set when the RUNNING count was found above capacity.
    quarantined: bool,
}

/// Owns one lock per task group.  Passed explicitly to whoever needs it.
#[derive(Debug)]
pub struct AdmissionControllerRegistry {
    pool: DbPool,
    slots: Mutex<HashMap<i64, Arc<Mutex<GroupSlot>>>>,
}

impl AdmissionControllerRegistry {
    pub fn new(pool: DbPool) -> Self {
        Self { pool, slots: Mutex::new(HashMap::new()) }
    }

    pub fn create_group(&self, name: &str, project_code: i64, group_size: u32) -> EngineResult<TaskGroup> {
        let group = group_repo::create_group(&self.pool, name, project_code, group_size)?;
        info!(group_id = group.id, group_size, "Created task group '{}'", name);
        Ok(group)
    }

    /// Claim a slot for `task_instance_id`.
    ///
    /// # Errors
    /// - [`EngineError::TaskGroupNotFound`] for an unknown group.
    /// - [`EngineError::GroupQuarantined`] while the group awaits an operator.
    /// - [`EngineError::CapacityExceeded`] if the group is found over capacity;
    ///   no entry is created and the group is quarantined.
    pub fn acquire(
        &self,
        task_group_id: i64,
        task_instance_id: i64,
        workflow_instance_id: i64,
        priority: Priority,
    ) -> EngineResult<Admission> {
        let slot = self.slot(task_group_id);
        let mut slot = slot.lock();

        let group = self.group(task_group_id)?;
        if slot.quarantined {
            return Err(EngineError::GroupQuarantined(task_group_id));
        }
        let running = self.verify_capacity(&group, &mut slot)?;

        let grant = group.status == TaskGroupStatus::Enabled && running < group.group_size as usize;
        let status = if grant { TaskGroupQueueStatus::Running } else { TaskGroupQueueStatus::Waiting };
        let entry = queue_repo::insert_entry(
            &self.pool,
            task_group_id,
            task_instance_id,
            workflow_instance_id,
            priority,
            status,
        )?;

        if grant {
            debug!(task_group_id, task_instance_id, queue_id = entry.id, "Task group slot granted");
            Ok(Admission::Granted(entry))
        } else {
            debug!(task_group_id, task_instance_id, queue_id = entry.id, "Task queued for group");
            Ok(Admission::Queued(entry))
        }
    }

    /// Release a queue entry and promote waiters into the freed capacity.
    ///
    /// Releasing an entry that is already released is a no-op.  Releasing a
    /// WAITING entry withdraws it without promoting anyone.  Returns the
    /// entries that moved to RUNNING.
    pub fn release(&self, queue_id: i64) -> EngineResult<Vec<TaskGroupQueue>> {
        let task_group_id = queue_repo::get_entry(&self.pool, queue_id)?.task_group_id;
        let slot = self.slot(task_group_id);
        let mut slot = slot.lock();

        let entry = queue_repo::get_entry(&self.pool, queue_id)?;
        match entry.status {
            TaskGroupQueueStatus::Released | TaskGroupQueueStatus::ForceReleased => {
                debug!(queue_id, "Queue entry already released");
                Ok(Vec::new())
            }
            TaskGroupQueueStatus::Waiting => {
                queue_repo::compare_and_set_status(
                    &self.pool,
                    queue_id,
                    TaskGroupQueueStatus::Waiting,
                    TaskGroupQueueStatus::Released,
                )?;
                debug!(queue_id, "Waiting queue entry withdrawn");
                Ok(Vec::new())
            }
            TaskGroupQueueStatus::Running => {
                queue_repo::compare_and_set_status(
                    &self.pool,
                    queue_id,
                    TaskGroupQueueStatus::Running,
                    TaskGroupQueueStatus::Released,
                )?;
                debug!(queue_id, task_group_id, "Task group slot released");
                let group = self.group(task_group_id)?;
                self.promote(&group, &mut slot)
            }
        }
    }

    /// Operator unblock: release every RUNNING entry of the group, then
    /// promote waiters up to capacity.  Works on a quarantined group but
    /// promotes nothing until the quarantine is cleared.
    pub fn force_release(&self, task_group_id: i64) -> EngineResult<Vec<TaskGroupQueue>> {
        let slot = self.slot(task_group_id);
        let mut slot = slot.lock();
        let group = self.group(task_group_id)?;

        let running = queue_repo::running_entries(&self.pool, task_group_id);
        for entry in &running {
            queue_repo::compare_and_set_status(
                &self.pool,
                entry.id,
                TaskGroupQueueStatus::Running,
                TaskGroupQueueStatus::ForceReleased,
            )?;
        }
        warn!(task_group_id, released = running.len(), "Task group force-released");

        if slot.quarantined {
            return Ok(Vec::new());
        }
        self.promote(&group, &mut slot)
    }

    /// Enable or disable the group.  Disabling never preempts RUNNING
    /// entries; enabling promotes waiters into any free capacity.
    pub fn set_status(&self, task_group_id: i64, status: TaskGroupStatus) -> EngineResult<Vec<TaskGroupQueue>> {
        let slot = self.slot(task_group_id);
        let mut slot = slot.lock();

        let group = group_repo::set_status(&self.pool, task_group_id, status).map_err(|e| self.map_missing(e, task_group_id))?;
        info!(task_group_id, %status, "Task group status changed");
        self.promote(&group, &mut slot)
    }

    /// Change the capacity.  Growing promotes waiters immediately; shrinking
    /// below the current RUNNING count is refused.
    pub fn update_capacity(&self, task_group_id: i64, group_size: u32) -> EngineResult<Vec<TaskGroupQueue>> {
        let slot = self.slot(task_group_id);
        let mut slot = slot.lock();
        self.group(task_group_id)?;

        let running = queue_repo::count_running(&self.pool, task_group_id);
        if (group_size as usize) < running {
            return Err(EngineError::CapacityInUse { group_id: task_group_id, running, requested: group_size });
        }
        let group = group_repo::set_group_size(&self.pool, task_group_id, group_size)?;
        info!(task_group_id, group_size, "Task group capacity changed");
        self.promote(&group, &mut slot)
    }

    /// Lift a quarantine after an operator has repaired the group.
    pub fn clear_quarantine(&self, task_group_id: i64) -> EngineResult<Vec<TaskGroupQueue>> {
        let slot = self.slot(task_group_id);
        let mut slot = slot.lock();
        let group = self.group(task_group_id)?;

        slot.quarantined = false;
        info!(task_group_id, "Task group quarantine cleared");
        self.promote(&group, &mut slot)
    }

    pub fn snapshot(&self, task_group_id: i64) -> EngineResult<GroupSnapshot> {
        let slot = self.slot(task_group_id);
        let slot = slot.lock();
        let group = self.group(task_group_id)?;

        Ok(GroupSnapshot {
            running: queue_repo::count_running(&self.pool, task_group_id),
            waiting: queue_repo::waiting_in_order(&self.pool, task_group_id).len(),
            quarantined: slot.quarantined,
            group,
        })
    }

    // -----------------------------------------------------------------------
    // Internal: everything below runs with the group lock held.
    // -----------------------------------------------------------------------

    fn promote(&self, group: &TaskGroup, slot: &mut GroupSlot) -> EngineResult<Vec<TaskGroupQueue>> {
        if slot.quarantined || group.status == TaskGroupStatus::Disabled {
            return Ok(Vec::new());
        }

        let running = self.verify_capacity(group, slot)?;
        let free = (group.group_size as usize).saturating_sub(running);

        let mut promoted = Vec::new();
        for entry in queue_repo::waiting_in_order(&self.pool, group.id).into_iter().take(free) {
            let entry = queue_repo::compare_and_set_status(
                &self.pool,
                entry.id,
                TaskGroupQueueStatus::Waiting,
                TaskGroupQueueStatus::Running,
            )?;
            debug!(task_group_id = group.id, queue_id = entry.id, task_instance_id = entry.task_instance_id, "Promoted waiting task");
            promoted.push(entry);
        }

        self.verify_capacity(group, slot)?;
        Ok(promoted)
    }

    /// Returns the RUNNING count, or quarantines the group if it exceeds
    /// capacity.
    fn verify_capacity(&self, group: &TaskGroup, slot: &mut GroupSlot) -> EngineResult<usize> {
        let running = queue_repo::count_running(&self.pool, group.id);
        if running > group.group_size as usize {
            slot.quarantined = true;
            error!(
                task_group_id = group.id,
                running,
                capacity = group.group_size,
                "Task group capacity invariant violated; admissions halted"
            );
            return Err(EngineError::CapacityExceeded {
                group_id: group.id,
                running,
                capacity: group.group_size,
            });
        }
        Ok(running)
    }

    fn group(&self, task_group_id: i64) -> EngineResult<TaskGroup> {
        group_repo::get_group(&self.pool, task_group_id).map_err(|e| self.map_missing(e, task_group_id))
    }

    fn map_missing(&self, err: DbError, task_group_id: i64) -> EngineError {
        match err {
            DbError::NotFound { .. } => EngineError::TaskGroupNotFound(task_group_id),
            other => other.into(),
        }
    }

    fn slot(&self, task_group_id: i64) -> Arc<Mutex<GroupSlot>> {
        self.slots.lock().entry(task_group_id).or_default().clone()
    }
}
