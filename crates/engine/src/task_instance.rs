//! Task instance lifecycle.
//!
//! ```text
//! SUBMITTED -> DISPATCHED -> RUNNING -> SUCCESS | FAILURE | KILLED | PAUSED
//!     ^                                    |
//!     +---------- retry (attempt + 1) -----+   while attempts remain
//! ```
//!
//! A `FAILURE` row with attempts left is *awaiting retry* and still counts as
//! live; once attempts are exhausted it is terminal.  Retry exhaustion is
//! never an error, it is simply a terminal `FAILURE`.

use chrono::{DateTime, Duration, Utc};

use db::models::{TaskExecutionStatus, TaskInstance};

use crate::error::{EngineError, EngineResult};
use crate::models::{TaskDefinition, TimeoutPolicy};

use TaskExecutionStatus::*;

/// Inputs that move a task instance between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEvent {
    /// Handed to a worker (or a child workflow started).
    Dispatch,
    Start,
    Succeed,
    Fail,
    Kill,
    Pause,
    /// Paused back to submitted.
    Resume,
    /// Failure back to submitted with the next attempt.
    Retry,
    /// Administrative override.
    ForceSuccess,
    /// The worker host was lost; submit the same attempt again.
    Resubmit,
}

impl TaskEvent {
    fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Start => "start",
            Self::Succeed => "succeed",
            Self::Fail => "fail",
            Self::Kill => "kill",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Retry => "retry",
            Self::ForceSuccess => "force success",
            Self::Resubmit => "resubmit",
        }
    }
}

/// Transition table.  `None` means the edge does not exist.
///
/// Edges leaving `Failure` are only legal while the instance awaits a retry;
/// [`TaskLifecycle::apply`] enforces that guard.
pub fn next_state(from: TaskExecutionStatus, event: TaskEvent) -> Option<TaskExecutionStatus> {
    let to = match (from, event) {
        (Submitted, TaskEvent::Dispatch) => Dispatched,
        (Dispatched, TaskEvent::Start) => Running,
        (Dispatched | Running, TaskEvent::Succeed) => Success,
        (Dispatched | Running, TaskEvent::Fail) => Failure,
        (Submitted | Dispatched | Running | Paused | Failure, TaskEvent::Kill) => Killed,
        (Submitted | Dispatched | Running, TaskEvent::Pause) => Paused,
        (Paused, TaskEvent::Resume) => Submitted,
        (Failure, TaskEvent::Retry) => Submitted,
        (Submitted | Dispatched | Running | Paused | Failure, TaskEvent::ForceSuccess) => ForcedSuccess,
        (Dispatched | Running, TaskEvent::Resubmit) => Submitted,
        _ => return None,
    };
    Some(to)
}

/// Retry and timeout settings of one task, resolved from its definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskLifecycle {
    /// First attempt plus retries.
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub timeout: Option<TimeoutPolicy>,
}

impl TaskLifecycle {
    /// A zero retry interval on the definition falls back to `default_retry_interval`.
    pub fn for_definition(definition: &TaskDefinition, default_retry_interval: std::time::Duration) -> Self {
        let retry_interval = if definition.retry_interval_secs == 0 {
            Duration::from_std(default_retry_interval).unwrap_or_else(|_| Duration::zero())
        } else {
            Duration::seconds(definition.retry_interval_secs as i64)
        };
        Self {
            max_attempts: definition.retry_times.saturating_add(1),
            retry_interval,
            timeout: definition.timeout,
        }
    }

    pub fn retries_remaining(&self, task: &TaskInstance) -> bool {
        task.attempt < self.max_attempts
    }

    pub fn awaiting_retry(&self, task: &TaskInstance) -> bool {
        task.state == Failure && self.retries_remaining(task)
    }

    /// Success, forced success, killed, or failure with no attempts left.
    pub fn is_terminal(&self, task: &TaskInstance) -> bool {
        match task.state {
            Success | ForcedSuccess | Killed => true,
            Failure => !self.retries_remaining(task),
            Submitted | Dispatched | Running | Paused => false,
        }
    }

    pub fn retry_due(&self, task: &TaskInstance, now: DateTime<Utc>) -> bool {
        self.awaiting_retry(task) && task.end_time.map_or(true, |end| end + self.retry_interval <= now)
    }

    /// The timeout policy, if a running attempt has exceeded it.
    pub fn timed_out(&self, task: &TaskInstance, now: DateTime<Utc>) -> Option<TimeoutPolicy> {
        let policy = self.timeout?;
        let started = task.start_time?;
        (task.state == Running && started + Duration::seconds(policy.seconds as i64) <= now).then_some(policy)
    }

    /// Apply `event` to `task`, stamping timestamps on the way.
    ///
    /// # Errors
    /// [`EngineError::InvalidTransition`] if the table has no such edge, or
    /// if the event would leave a terminal `FAILURE`.
    pub fn apply(&self, task: &mut TaskInstance, event: TaskEvent, now: DateTime<Utc>) -> EngineResult<TaskExecutionStatus> {
        let illegal = || EngineError::invalid("task instance", task.id, task.state, event.name());

        if task.state == Failure && !self.retries_remaining(task) {
            return Err(illegal());
        }
        let to = next_state(task.state, event).ok_or_else(illegal)?;

        match event {
            TaskEvent::Start => {
                task.start_time = Some(now);
            }
            TaskEvent::Succeed | TaskEvent::Fail | TaskEvent::Kill | TaskEvent::ForceSuccess => {
                task.start_time.get_or_insert(now);
                task.end_time = Some(now);
            }
            TaskEvent::Retry => {
                task.attempt += 1;
                task.submit_time = now;
                task.start_time = None;
                task.end_time = None;
                task.host = None;
                task.error_message = None;
            }
            TaskEvent::Resubmit => {
                task.submit_time = now;
                task.start_time = None;
                task.host = None;
            }
            TaskEvent::Dispatch | TaskEvent::Pause | TaskEvent::Resume => {}
        }
        task.state = to;
        Ok(to)
    }
}

/// Hand out the held queue entry exactly once.
///
/// Returns the entry id the first time it is called after an entry was
/// assigned; later calls return `None` until a new entry is assigned.
pub fn take_queue_release(task: &mut TaskInstance) -> Option<i64> {
    match task.task_group_queue_id {
        Some(queue_id) if !task.queue_released => {
            task.queue_released = true;
            Some(queue_id)
        }
        _ => None,
    }
}

/// True when the task is gated by a group and holds no live entry.
pub fn needs_slot(task: &TaskInstance) -> bool {
    task.task_group_id.is_some() && (task.task_group_queue_id.is_none() || task.queue_released)
}

/// Record a fresh queue entry on the task.
pub fn assign_queue_entry(task: &mut TaskInstance, queue_id: i64) {
    task.task_group_queue_id = Some(queue_id);
    task.queue_released = false;
}

// ===========================================================================
// Unit tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TimeoutStrategy;
    use db::models::Priority;

    fn task(state: TaskExecutionStatus) -> TaskInstance {
        TaskInstance {
            id: 7,
            workflow_instance_id: 1,
            task_code: 10,
            task_version: 1,
            name: "extract".into(),
            task_type: "SHELL".into(),
            state,
            attempt: 1,
            priority: Priority::Medium,
            worker_group: "default".into(),
            host: None,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            task_group_id: None,
            task_group_queue_id: None,
            queue_released: false,
            branch: None,
            error_message: None,
        }
    }

    fn lifecycle(retries: u32) -> TaskLifecycle {
        let definition = TaskDefinition::new(10, "extract", "SHELL").with_retries(retries, 30);
        TaskLifecycle::for_definition(&definition, std::time::Duration::from_secs(60))
    }

    #[test]
    fn happy_path_stamps_times() {
        let lc = lifecycle(0);
        let mut t = task(Submitted);
        let now = Utc::now();

        lc.apply(&mut t, TaskEvent::Dispatch, now).unwrap();
        lc.apply(&mut t, TaskEvent::Start, now).unwrap();
        lc.apply(&mut t, TaskEvent::Succeed, now).unwrap();

        assert_eq!(t.state, Success);
        assert_eq!(t.start_time, Some(now));
        assert_eq!(t.end_time, Some(now));
        assert!(lc.is_terminal(&t));
    }

    #[test]
    fn failure_with_attempts_left_waits_for_retry_interval() {
        let lc = lifecycle(1);
        let mut t = task(Running);
        let failed_at = Utc::now();
        lc.apply(&mut t, TaskEvent::Fail, failed_at).unwrap();

        assert!(lc.awaiting_retry(&t));
        assert!(!lc.is_terminal(&t));
        assert!(!lc.retry_due(&t, failed_at + Duration::seconds(29)));
        assert!(lc.retry_due(&t, failed_at + Duration::seconds(30)));

        lc.apply(&mut t, TaskEvent::Retry, failed_at + Duration::seconds(30)).unwrap();
        assert_eq!((t.state, t.attempt), (Submitted, 2));
        assert_eq!(t.end_time, None);
    }

    #[test]
    fn exhausted_failure_is_terminal_and_frozen() {
        let lc = lifecycle(1);
        let mut t = task(Running);
        t.attempt = 2;
        lc.apply(&mut t, TaskEvent::Fail, Utc::now()).unwrap();

        assert!(lc.is_terminal(&t));
        assert!(matches!(
            lc.apply(&mut t, TaskEvent::Retry, Utc::now()),
            Err(EngineError::InvalidTransition { .. })
        ));
        assert!(lc.apply(&mut t, TaskEvent::ForceSuccess, Utc::now()).is_err());
    }

    #[test]
    fn force_success_from_any_live_state() {
        let lc = lifecycle(2);
        for state in [Submitted, Dispatched, Running, Paused] {
            let mut t = task(state);
            assert_eq!(lc.apply(&mut t, TaskEvent::ForceSuccess, Utc::now()).unwrap(), ForcedSuccess);
        }
        let mut awaiting = task(Failure);
        assert_eq!(lc.apply(&mut awaiting, TaskEvent::ForceSuccess, Utc::now()).unwrap(), ForcedSuccess);
    }

    #[test]
    fn success_cannot_be_killed() {
        let lc = lifecycle(0);
        let mut t = task(Success);
        assert!(lc.apply(&mut t, TaskEvent::Kill, Utc::now()).is_err());
        assert_eq!(t.state, Success);
    }

    #[test]
    fn pause_and_resume() {
        let lc = lifecycle(0);
        let mut t = task(Submitted);
        lc.apply(&mut t, TaskEvent::Pause, Utc::now()).unwrap();
        assert!(!lc.is_terminal(&t));
        lc.apply(&mut t, TaskEvent::Resume, Utc::now()).unwrap();
        assert_eq!(t.state, Submitted);
    }

    #[test]
    fn resubmit_keeps_the_attempt() {
        let lc = lifecycle(0);
        let mut t = task(Running);
        t.host = Some("worker-3".into());
        lc.apply(&mut t, TaskEvent::Resubmit, Utc::now()).unwrap();
        assert_eq!((t.state, t.attempt, t.host.as_deref()), (Submitted, 1, None));
    }

    #[test]
    fn timeout_only_applies_to_running_attempts() {
        let definition = TaskDefinition::new(10, "extract", "SHELL").with_timeout(60, TimeoutStrategy::WarnFail);
        let lc = TaskLifecycle::for_definition(&definition, std::time::Duration::from_secs(1));
        let started = Utc::now();
        let mut t = task(Running);
        t.start_time = Some(started);

        assert!(lc.timed_out(&t, started + Duration::seconds(59)).is_none());
        assert!(lc.timed_out(&t, started + Duration::seconds(60)).is_some());

        t.state = Success;
        assert!(lc.timed_out(&t, started + Duration::seconds(600)).is_none());
    }

    #[test]
    fn zero_retry_interval_uses_default() {
        let definition = TaskDefinition::new(1, "t", "SHELL").with_retries(3, 0);
        let lc = TaskLifecycle::for_definition(&definition, std::time::Duration::from_secs(5));
        assert_eq!(lc.retry_interval, Duration::seconds(5));
        assert_eq!(lc.max_attempts, 4);
    }

    #[test]
    fn queue_entry_is_released_once() {
        let mut t = task(Running);
        t.task_group_id = Some(3);
        assert!(needs_slot(&t));

        assign_queue_entry(&mut t, 42);
        assert!(!needs_slot(&t));
        assert_eq!(take_queue_release(&mut t), Some(42));
        assert_eq!(take_queue_release(&mut t), None);
        assert!(needs_slot(&t));
    }
}
