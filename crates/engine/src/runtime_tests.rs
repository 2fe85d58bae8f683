//! End-to-end tests for the runtime.
//!
//! A `MockWorker` records every dispatch; tests play the worker's part by
//! posting hand-written `TaskReport`s back through `Runtime::report` and
//! then poll the store until the engine caught up.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use db::create_pool;
use db::models::{FailureStrategy, TaskExecutionStatus as Ts, WorkflowExecutionStatus as Wf, WorkflowInstance};
use db::repository::workflow_instances as instance_repo;
use worker::mock::MockWorker;
use worker::{ReportedState, TaskDispatch, TaskReport};

use crate::config::EngineConfig;
use crate::dispatcher::InMemoryCatalog;
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::models::{
    Command, CommandKind, ComplementDependentMode, ComplementParams, ExecutionOrder, ExecutionType, ScheduleSpec,
    TaskDefinition, TaskRelation, TimeoutStrategy, WorkflowDefinition, SUB_WORKFLOW_TASK_TYPE,
};
use crate::runtime::Runtime;

const WAIT: Duration = Duration::from_secs(5);

struct Fixture {
    runtime: Runtime,
    worker: Arc<MockWorker>,
    catalog: Arc<InMemoryCatalog>,
}

fn fixture(definitions: Vec<WorkflowDefinition>) -> Fixture {
    fixture_with(definitions, MockWorker::accepting())
}

fn fixture_with(definitions: Vec<WorkflowDefinition>, worker: MockWorker) -> Fixture {
    let catalog = Arc::new(InMemoryCatalog::new());
    for definition in definitions {
        catalog.publish(definition).unwrap();
    }
    let worker = Arc::new(worker);
    let config = EngineConfig { default_retry_interval: Duration::ZERO, ..EngineConfig::default() };
    let runtime = Runtime::new(create_pool(), catalog.clone(), worker.clone(), config);
    Fixture { runtime, worker, catalog }
}

async fn eventually(what: &str, check: impl Fn() -> bool) {
    let started = tokio::time::Instant::now();
    while !check() {
        assert!(started.elapsed() < WAIT, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

impl Fixture {
    fn dispatch_of(&self, instance_id: i64, task_code: i64, attempt: u32) -> Option<TaskDispatch> {
        self.worker
            .submitted
            .lock()
            .iter()
            .find(|d| d.workflow_instance_id == instance_id && d.task_code == task_code && d.attempt == attempt)
            .cloned()
    }

    async fn dispatched(&self, instance_id: i64, task_code: i64) -> TaskDispatch {
        self.dispatched_attempt(instance_id, task_code, 1).await
    }

    async fn dispatched_attempt(&self, instance_id: i64, task_code: i64, attempt: u32) -> TaskDispatch {
        eventually(&format!("dispatch of task {task_code}"), || {
            self.dispatch_of(instance_id, task_code, attempt).is_some()
        })
        .await;
        self.dispatch_of(instance_id, task_code, attempt).unwrap()
    }

    fn send(&self, dispatch: &TaskDispatch, state: ReportedState) {
        self.runtime
            .report(TaskReport::new(dispatch.task_instance_id, dispatch.attempt, state))
            .unwrap();
    }

    fn succeed(&self, dispatch: &TaskDispatch) {
        self.send(dispatch, ReportedState::Success { branch: None });
    }

    fn fail(&self, dispatch: &TaskDispatch) {
        self.send(dispatch, ReportedState::Failure { message: "exit code 1".into() });
    }

    async fn terminal(&self, instance_id: i64) -> WorkflowInstance {
        self.runtime.await_state(instance_id, Wf::is_terminal, WAIT).await.unwrap()
    }

    async fn reaches(&self, instance_id: i64, state: Wf) -> WorkflowInstance {
        self.runtime.await_state(instance_id, |s| s == state, WAIT).await.unwrap()
    }

    fn task_state(&self, instance_id: i64, task_code: i64) -> Option<Ts> {
        self.runtime
            .task_instances(instance_id)
            .into_iter()
            .rev()
            .find(|t| t.task_code == task_code)
            .map(|t| t.state)
    }

    async fn start(&self, command: Command) -> WorkflowInstance {
        self.runtime.submit(command).await.unwrap().remove(0)
    }
}

fn shell(code: i64) -> TaskDefinition {
    TaskDefinition::new(code, format!("task-{code}"), "SHELL")
}

/// 1 -> 2, 1 -> 3
fn fan_out(code: i64) -> WorkflowDefinition {
    WorkflowDefinition::new(
        code,
        "fan-out",
        vec![shell(1), shell(2), shell(3)],
        vec![TaskRelation::new(1, 2), TaskRelation::new(1, 3)],
    )
}

fn single(code: i64, task: TaskDefinition) -> WorkflowDefinition {
    WorkflowDefinition::new(code, format!("single-{code}"), vec![task], vec![])
}

fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, d, 0, 0, 0).unwrap()
}

// ============================================================
// Lifecycle
// ============================================================

#[tokio::test]
async fn fan_out_runs_to_success() {
    let f = fixture(vec![fan_out(1)]);
    let instance = f.start(Command::start(1)).await;

    let a = f.dispatched(instance.id, 1).await;
    f.succeed(&a);
    let b = f.dispatched(instance.id, 2).await;
    let c = f.dispatched(instance.id, 3).await;
    f.succeed(&b);
    f.succeed(&c);

    let done = f.terminal(instance.id).await;
    assert_eq!(done.state, Wf::Success);
    assert!(done.end_time.is_some());
    assert!(f.runtime.task_instances(instance.id).iter().all(|t| t.state == Ts::Success));
}

#[tokio::test]
async fn end_strategy_kills_running_siblings() {
    let f = fixture(vec![fan_out(2)]);
    let instance = f.start(Command::start(2).with_failure_strategy(FailureStrategy::End)).await;

    f.succeed(&f.dispatched(instance.id, 1).await);
    let b = f.dispatched(instance.id, 2).await;
    let c = f.dispatched(instance.id, 3).await;
    f.fail(&b);

    assert_eq!(f.terminal(instance.id).await.state, Wf::Failure);
    eventually("kill of the running sibling", || f.worker.kill_requests().contains(&c.task_instance_id)).await;

    f.send(&c, ReportedState::Killed);
    eventually("sibling acknowledged", || f.task_state(instance.id, 3) == Some(Ts::Killed)).await;
}

#[tokio::test]
async fn continue_strategy_lets_siblings_finish() {
    let f = fixture(vec![fan_out(3)]);
    let instance = f.start(Command::start(3).with_failure_strategy(FailureStrategy::Continue)).await;

    f.succeed(&f.dispatched(instance.id, 1).await);
    let b = f.dispatched(instance.id, 2).await;
    let c = f.dispatched(instance.id, 3).await;
    f.fail(&b);
    f.succeed(&c);

    assert_eq!(f.terminal(instance.id).await.state, Wf::Failure);
    assert_eq!(f.task_state(instance.id, 3), Some(Ts::Success));
    assert!(f.worker.kill_requests().is_empty());
}

#[tokio::test]
async fn stop_waits_for_every_kill_acknowledgement() {
    let f = fixture(vec![fan_out(4)]);
    let instance = f.start(Command::start(4)).await;

    f.succeed(&f.dispatched(instance.id, 1).await);
    let b = f.dispatched(instance.id, 2).await;
    let c = f.dispatched(instance.id, 3).await;
    f.send(&b, ReportedState::Running);
    f.send(&c, ReportedState::Running);
    eventually("both running", || {
        f.task_state(instance.id, 2) == Some(Ts::Running) && f.task_state(instance.id, 3) == Some(Ts::Running)
    })
    .await;

    let stopping = f.runtime.stop(instance.id).await.unwrap();
    assert_eq!(stopping.state, Wf::ReadyStop);
    let mut kills = f.worker.kill_requests();
    kills.sort_unstable();
    assert_eq!(kills, vec![b.task_instance_id, c.task_instance_id]);

    f.send(&b, ReportedState::Killed);
    eventually("first acknowledgement", || f.task_state(instance.id, 2) == Some(Ts::Killed)).await;
    assert_eq!(f.runtime.instance(instance.id).unwrap().state, Wf::ReadyStop);

    f.send(&c, ReportedState::Killed);
    assert_eq!(f.terminal(instance.id).await.state, Wf::Stop);
}

#[tokio::test]
async fn pause_and_resume_through_commands() {
    let chain = WorkflowDefinition::new(5, "chain", vec![shell(1), shell(2)], vec![TaskRelation::new(1, 2)]);
    let f = fixture(vec![chain]);
    let instance = f.start(Command::start(5)).await;
    let a = f.dispatched(instance.id, 1).await;

    assert_eq!(f.runtime.pause(instance.id).await.unwrap().state, Wf::ReadyPause);
    f.succeed(&a);
    f.reaches(instance.id, Wf::Pause).await;
    assert!(f.dispatch_of(instance.id, 2, 1).is_none());

    assert_eq!(f.runtime.resume(instance.id).await.unwrap().state, Wf::RunningExecution);
    f.succeed(&f.dispatched(instance.id, 2).await);
    assert_eq!(f.terminal(instance.id).await.state, Wf::Success);
}

#[tokio::test]
async fn failed_attempt_is_retried_on_tick() {
    let f = fixture(vec![single(6, shell(1).with_retries(1, 0))]);
    let instance = f.start(Command::start(6)).await;

    f.fail(&f.dispatched(instance.id, 1).await);
    eventually("first attempt failed", || f.task_state(instance.id, 1) == Some(Ts::Failure)).await;
    assert_eq!(f.runtime.instance(instance.id).unwrap().state, Wf::RunningExecution);

    f.runtime.tick(Utc::now());
    let retry = f.dispatched_attempt(instance.id, 1, 2).await;
    f.succeed(&retry);
    assert_eq!(f.terminal(instance.id).await.state, Wf::Success);
}

#[tokio::test]
async fn timed_out_attempt_uses_one_retry() {
    let task = shell(1).with_retries(2, 60).with_timeout(1, TimeoutStrategy::Fail);
    let f = fixture(vec![single(7, task)]);
    let instance = f.start(Command::start(7).with_failure_strategy(FailureStrategy::End)).await;

    let first = f.dispatched(instance.id, 1).await;
    f.send(&first, ReportedState::Running);
    eventually("attempt running", || f.task_state(instance.id, 1) == Some(Ts::Running)).await;

    let started = Utc::now();
    f.runtime.tick(started + chrono::Duration::seconds(5));
    eventually("kill of the overrunning attempt", || f.worker.kill_requests().contains(&first.task_instance_id)).await;

    f.send(&first, ReportedState::Killed);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(f.task_state(instance.id, 1), Some(Ts::Failure));
    assert_eq!(f.runtime.instance(instance.id).unwrap().state, Wf::RunningExecution);

    f.runtime.tick(started + chrono::Duration::seconds(70));
    let retry = f.dispatched_attempt(instance.id, 1, 2).await;
    f.succeed(&retry);
    assert_eq!(f.terminal(instance.id).await.state, Wf::Success);
}

#[tokio::test]
async fn rejected_dispatch_fails_the_task() {
    let f = fixture_with(vec![single(7, shell(1))], MockWorker::rejecting("unknown worker group"));
    let instance = f.start(Command::start(7)).await;

    assert_eq!(f.terminal(instance.id).await.state, Wf::Failure);
    let task = f.runtime.task_instances(instance.id).remove(0);
    assert_eq!(task.state, Ts::Failure);
    assert!(task.error_message.unwrap().contains("unknown worker group"));
}

#[tokio::test]
async fn fault_tolerance_recovery_resubmits_in_flight_tasks() {
    let f = fixture(vec![single(8, shell(1))]);
    let instance = f.start(Command::start(8)).await;
    f.dispatched(instance.id, 1).await;

    let recover = Command::new(8, CommandKind::RecoverToleranceFaultProcess { instance_id: instance.id });
    f.runtime.submit(recover).await.unwrap();
    eventually("second submission", || f.worker.submit_count() == 2).await;

    f.succeed(&f.dispatched(instance.id, 1).await);
    assert_eq!(f.terminal(instance.id).await.state, Wf::Success);
}

// ============================================================
// Overrides
// ============================================================

#[tokio::test]
async fn forcing_a_running_task_unblocks_its_successors() {
    let chain = WorkflowDefinition::new(9, "chain", vec![shell(1), shell(2)], vec![TaskRelation::new(1, 2)]);
    let f = fixture(vec![chain]);
    let instance = f.start(Command::start(9)).await;
    let a = f.dispatched(instance.id, 1).await;

    f.runtime.force_task_success(a.task_instance_id).await.unwrap();
    assert_eq!(f.task_state(instance.id, 1), Some(Ts::ForcedSuccess));
    assert!(f.worker.kill_requests().contains(&a.task_instance_id));

    let b = f.dispatched(instance.id, 2).await;
    f.succeed(&b);
    assert_eq!(f.terminal(instance.id).await.state, Wf::Success);

    // Finished instances take no more overrides.
    let late = f.runtime.force_task_success(b.task_instance_id).await;
    assert!(matches!(late, Err(EngineError::InvalidTransition { .. })));
}

#[tokio::test]
async fn force_success_applies_only_to_failed_instances() {
    let f = fixture(vec![single(10, shell(1))]);
    let instance = f.start(Command::start(10)).await;

    let early = f.runtime.force_success(instance.id).await;
    assert!(matches!(early, Err(EngineError::InvalidTransition { .. })));

    f.fail(&f.dispatched(instance.id, 1).await);
    f.reaches(instance.id, Wf::Failure).await;

    f.runtime.force_success(instance.id).await.unwrap();
    let forced = f.runtime.instance(instance.id).unwrap();
    assert_eq!(forced.state, Wf::Success);
    assert!(forced.forced_success);
}

// ============================================================
// Serial definitions and task groups
// ============================================================

#[tokio::test]
async fn serial_instances_run_one_after_another() {
    let f = fixture(vec![single(11, shell(1)).with_execution_type(ExecutionType::Serial)]);
    let first = f.start(Command::start(11)).await;
    let second = f.start(Command::start(11)).await;
    assert_eq!(second.state, Wf::WaitingThread);

    let a = f.dispatched(first.id, 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(f.dispatch_of(second.id, 1, 1).is_none());

    f.succeed(&a);
    f.terminal(first.id).await;
    f.succeed(&f.dispatched(second.id, 1).await);
    assert_eq!(f.terminal(second.id).await.state, Wf::Success);
}

#[tokio::test]
async fn waiting_instance_runs_the_version_it_was_created_from() {
    let f = fixture(vec![single(13, shell(1)).with_execution_type(ExecutionType::Serial)]);
    let first = f.start(Command::start(13)).await;
    let second = f.start(Command::start(13)).await;
    assert_eq!(second.state, Wf::WaitingThread);
    assert_eq!(second.definition_version, 1);

    let version = f.catalog.publish(single(13, shell(9)).with_execution_type(ExecutionType::Serial)).unwrap();
    assert_eq!(version, 2);

    f.succeed(&f.dispatched(first.id, 1).await);
    f.succeed(&f.dispatched(second.id, 1).await);
    assert_eq!(f.terminal(second.id).await.state, Wf::Success);
    let codes: Vec<i64> = f.runtime.task_instances(second.id).iter().map(|t| t.task_code).collect();
    assert_eq!(codes, vec![1]);
}

#[tokio::test]
async fn restarted_runtime_hands_an_orphaned_lane_to_the_oldest_waiter() {
    let f = fixture(vec![single(14, shell(1)).with_execution_type(ExecutionType::Serial)]);
    let first = f.start(Command::start(14)).await;
    let second = f.start(Command::start(14)).await;
    f.dispatched(first.id, 1).await;
    // The holder finished but the hand-off never happened.
    instance_repo::compare_and_set_state(f.runtime.pool(), first.id, Wf::RunningExecution, Wf::Success).unwrap();

    let worker = Arc::new(MockWorker::accepting());
    let config = EngineConfig { default_retry_interval: Duration::ZERO, ..EngineConfig::default() };
    let restarted = Fixture {
        runtime: Runtime::new(f.runtime.pool().clone(), f.catalog.clone(), worker.clone(), config),
        worker,
        catalog: f.catalog.clone(),
    };
    assert_eq!(restarted.runtime.recover_serial_lanes(), 1);
    assert_eq!(restarted.runtime.dispatcher().serial().active(14), Some(second.id));

    let third = restarted.start(Command::start(14)).await;
    assert_eq!(third.state, Wf::WaitingThread);

    restarted.succeed(&restarted.dispatched(second.id, 1).await);
    assert_eq!(restarted.terminal(second.id).await.state, Wf::Success);
    restarted.succeed(&restarted.dispatched(third.id, 1).await);
    assert_eq!(restarted.terminal(third.id).await.state, Wf::Success);
}

#[tokio::test]
async fn task_group_slot_passes_between_instances() {
    let f = fixture(vec![]);
    let group = f.runtime.registry().create_group("warehouse", 1, 1).unwrap();
    f.catalog.publish(single(12, shell(1).in_task_group(group.id))).unwrap();

    let first = f.start(Command::start(12)).await;
    let second = f.start(Command::start(12)).await;

    let a = f.dispatched(first.id, 1).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(f.dispatch_of(second.id, 1, 1).is_none());
    assert_eq!(f.runtime.group_snapshot(group.id).unwrap().waiting, 1);

    f.succeed(&a);
    f.succeed(&f.dispatched(second.id, 1).await);
    assert_eq!(f.terminal(second.id).await.state, Wf::Success);
    assert_eq!(f.runtime.group_snapshot(group.id).unwrap().running, 0);
}

// ============================================================
// Sub-workflows
// ============================================================

#[tokio::test]
async fn sub_workflow_task_follows_its_child() {
    let child = single(50, shell(501));
    let mut call = TaskDefinition::new(601, "run-child", SUB_WORKFLOW_TASK_TYPE);
    call.params = json!({ "processDefinitionCode": 50 });
    let parent = WorkflowDefinition::new(60, "parent", vec![call, shell(602)], vec![TaskRelation::new(601, 602)]);
    let f = fixture(vec![child, parent]);

    let instance = f.start(Command::start(60)).await;
    eventually("child instance", || !instance_repo::list_by_definition(f.runtime.pool(), 50).is_empty()).await;
    let child = instance_repo::list_by_definition(f.runtime.pool(), 50).remove(0);
    assert_eq!(child.parent_instance_id, Some(instance.id));
    eventually("parent task running", || f.task_state(instance.id, 601) == Some(Ts::Running)).await;

    f.succeed(&f.dispatched(child.id, 501).await);
    assert_eq!(f.terminal(child.id).await.state, Wf::Success);

    f.succeed(&f.dispatched(instance.id, 602).await);
    assert_eq!(f.terminal(instance.id).await.state, Wf::Success);
    assert_eq!(f.task_state(instance.id, 601), Some(Ts::Success));
}

#[tokio::test]
async fn stopping_the_parent_kills_the_child() {
    let child = single(51, shell(511));
    let mut call = TaskDefinition::new(611, "run-child", SUB_WORKFLOW_TASK_TYPE);
    call.params = json!({ "processDefinitionCode": 51 });
    let f = fixture(vec![child, single(61, call)]);

    let instance = f.start(Command::start(61)).await;
    eventually("child instance", || !instance_repo::list_by_definition(f.runtime.pool(), 51).is_empty()).await;
    let child = instance_repo::list_by_definition(f.runtime.pool(), 51).remove(0);
    let grandchild_task = f.dispatched(child.id, 511).await;
    eventually("parent task running", || f.task_state(instance.id, 611) == Some(Ts::Running)).await;

    f.runtime.stop(instance.id).await.unwrap();
    eventually("child task kill", || f.worker.kill_requests().contains(&grandchild_task.task_instance_id)).await;
    f.send(&grandchild_task, ReportedState::Killed);

    assert_eq!(f.terminal(child.id).await.state, Wf::Kill);
    assert_eq!(f.terminal(instance.id).await.state, Wf::Stop);
}

// ============================================================
// Backfill
// ============================================================

#[tokio::test]
async fn dependent_backfill_waits_for_forced_success() {
    let f = fixture(vec![single(70, shell(1))]);
    let params = ComplementParams {
        schedule: ScheduleSpec::Range { start: day(1), end: day(3), interval_secs: 86_400 },
        order: ExecutionOrder::Asc,
        dependent_mode: ComplementDependentMode::AllDependent,
        expected_parallelism: 0,
    };
    let command = Command::complement(70, params);
    let complement_id = command.id;
    let instances = f.runtime.submit(command).await.unwrap();
    assert_eq!(instances.len(), 1);
    let pool = f.runtime.pool().clone();
    let by_date = |d: u32| {
        instance_repo::list_by_definition(&pool, 70)
            .into_iter()
            .find(|i| i.schedule_time == Some(day(d)))
    };

    f.succeed(&f.dispatched(instances[0].id, 1).await);
    eventually("second date", || by_date(2).is_some()).await;
    let second = by_date(2).unwrap();
    f.fail(&f.dispatched(second.id, 1).await);
    f.reaches(second.id, Wf::Failure).await;

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(by_date(3).is_none());
    assert_eq!(f.runtime.complement(complement_id).unwrap().blocked_on(), Some(day(2)));

    f.runtime.force_success(second.id).await.unwrap();
    eventually("third date", || by_date(3).is_some()).await;
    let third = by_date(3).unwrap();
    f.succeed(&f.dispatched(third.id, 1).await);
    f.terminal(third.id).await;
    eventually("backfill retired", || f.runtime.complement(complement_id).is_none()).await;
}

#[tokio::test]
async fn independent_backfill_respects_parallelism() {
    let f = fixture(vec![single(71, shell(1))]);
    let params = ComplementParams {
        schedule: ScheduleSpec::List { dates: vec![day(1), day(2), day(3)] },
        order: ExecutionOrder::Desc,
        dependent_mode: ComplementDependentMode::Off,
        expected_parallelism: 2,
    };
    let instances = f.runtime.submit(Command::complement(71, params)).await.unwrap();
    let dates: Vec<_> = instances.iter().map(|i| i.schedule_time).collect();
    assert_eq!(dates, vec![Some(day(3)), Some(day(2))]);

    // A failure frees the slot just like a success.
    f.fail(&f.dispatched(instances[1].id, 1).await);
    let pool = f.runtime.pool().clone();
    eventually("last date", || instance_repo::list_by_definition(&pool, 71).len() == 3).await;
}

// ============================================================
// Queue and notifications
// ============================================================

#[tokio::test]
async fn queued_commands_start_when_drained() {
    let f = fixture(vec![single(80, shell(1))]);
    f.runtime.enqueue(&Command::start(80)).unwrap();
    f.runtime.enqueue(&Command::start(404)).unwrap();

    assert_eq!(f.runtime.drain_commands().await, 2);
    assert_eq!(f.runtime.drain_commands().await, 0);

    let created = instance_repo::list_by_definition(f.runtime.pool(), 80);
    assert_eq!(created.len(), 1);
    f.dispatched(created[0].id, 1).await;
}

#[tokio::test]
async fn state_changes_are_published() {
    let f = fixture(vec![single(81, shell(1))]);
    let mut events = f.runtime.subscribe();
    let instance = f.start(Command::start(81)).await;
    f.succeed(&f.dispatched(instance.id, 1).await);

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        if let EngineEvent::WorkflowInstanceStateChanged { to, .. } = event {
            seen.push(to);
            if to.is_terminal() {
                break;
            }
        }
    }
    assert_eq!(seen, vec![Wf::RunningExecution, Wf::Success]);
}
