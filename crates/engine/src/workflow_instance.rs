//! Workflow instance state machine.
//!
//! One [`WorkflowInstanceMachine`] per running instance.  It is a reducer:
//! [`WorkflowInstanceMachine::apply`] consumes one [`InstanceEvent`], updates
//! the instance and its task instances in the store, and returns the
//! [`Effect`]s the caller must carry out (worker submissions, kill requests,
//! promotions for other instances, notifications).  Events for one instance
//! are applied strictly in order; different instances never share a machine.
//!
//! ```text
//! SUBMITTED_SUCCESS | WAITING_THREAD
//!        |
//!        v
//! RUNNING_EXECUTION --pause--> READY_PAUSE --(nothing in flight)--> PAUSE
//!        |          --stop---> READY_STOP  --(all kills acked)----> STOP | KILL
//!        v
//!   SUCCESS | FAILURE
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use db::models::{
    FailureStrategy, TaskExecutionStatus as Ts, TaskGroupQueue, TaskInstance, WorkflowExecutionStatus as Wf,
    WorkflowInstance,
};
use db::repository::{task_instances as task_repo, workflow_instances as instance_repo};
use db::{DbError, DbPool};
use worker::{ReportedState, TaskDispatch, TaskReport};

use crate::config::EngineConfig;
use crate::dag::{NodeOutcome, Readiness, Scope, WorkflowGraph};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::task_group::{Admission, AdmissionControllerRegistry};
use crate::task_instance::{self, TaskEvent, TaskLifecycle};

/// Inputs to a workflow instance.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    Start,
    TaskReport(TaskReport),
    /// A queued task group entry was promoted to RUNNING.
    SlotGranted { task_instance_id: i64 },
    /// The worker refused the submission.
    DispatchRejected { task_instance_id: i64, reason: String },
    /// Timer fire: retries, delays, timeouts and blocked admissions.
    Tick(DateTime<Utc>),
    Pause,
    Stop,
    /// Parent cancellation; like STOP but ends in KILL.
    Kill,
    Resume,
    /// Re-submit tasks that were in flight on a lost host.
    RecoverFaultTolerance,
    ForceTaskSuccess { task_instance_id: i64 },
    /// Operator override: FAILURE becomes SUCCESS.
    ForceSuccess,
}

/// Work the caller performs after an event was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Dispatch(TaskDispatch),
    KillTask { task_instance_id: i64, sub_workflow: bool },
    StartSubWorkflow { task_instance: TaskInstance, definition_code: i64 },
    /// Entries of (possibly other) instances that now hold a slot.
    Promoted(Vec<TaskGroupQueue>),
    Emit(EngineEvent),
    /// The instance reached a terminal state.
    Finished(Wf),
}

pub struct WorkflowInstanceMachine {
    pool: DbPool,
    registry: Arc<AdmissionControllerRegistry>,
    graph: Arc<WorkflowGraph>,
    lifecycles: Vec<TaskLifecycle>,
    host: String,
    instance: WorkflowInstance,
    scope: Scope,
    outcomes: BTreeMap<usize, NodeOutcome>,
    /// Latest task instance per graph node.
    tasks: BTreeMap<usize, TaskInstance>,
    /// Nodes whose task ended in terminal failure or was killed.
    failed: BTreeSet<usize>,
    /// Ready nodes held back by a delay edge.
    delayed: BTreeMap<usize, DateTime<Utc>>,
    warned: BTreeSet<(i64, u32)>,
    timeout_warned: bool,
    stop_target: Option<Wf>,
    effects: Vec<Effect>,
}

impl WorkflowInstanceMachine {
    pub fn new(
        pool: DbPool,
        registry: Arc<AdmissionControllerRegistry>,
        graph: Arc<WorkflowGraph>,
        instance: WorkflowInstance,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let scope = graph.scope(&instance.start_nodes, instance.task_depend_type)?;
        let lifecycles = (0..graph.len())
            .map(|node| TaskLifecycle::for_definition(graph.task(node), config.default_retry_interval))
            .collect();

        Ok(Self {
            pool,
            registry,
            graph,
            lifecycles,
            host: config.master_host.clone(),
            instance,
            scope,
            outcomes: BTreeMap::new(),
            tasks: BTreeMap::new(),
            failed: BTreeSet::new(),
            delayed: BTreeMap::new(),
            warned: BTreeSet::new(),
            timeout_warned: false,
            stop_target: None,
            effects: Vec::new(),
        })
    }

    /// Rebuild a machine from the store, e.g. after the previous owner died.
    pub fn restore(
        pool: DbPool,
        registry: Arc<AdmissionControllerRegistry>,
        graph: Arc<WorkflowGraph>,
        instance_id: i64,
        config: &EngineConfig,
    ) -> EngineResult<Self> {
        let instance = instance_repo::get_instance(&pool, instance_id).map_err(|e| match e {
            DbError::NotFound { .. } => EngineError::InstanceNotFound(instance_id),
            other => other.into(),
        })?;
        let rows = task_repo::list_by_workflow_instance(&pool, instance_id);
        let mut machine = Self::new(pool, registry, graph, instance, config)?;

        // Rows come in creation order, so the latest attempt row wins.
        for row in rows {
            if let Some(node) = machine.graph.node_of(row.task_code) {
                machine.tasks.insert(node, row);
            }
        }
        for (&node, task) in &machine.tasks {
            let lifecycle = machine.lifecycles[node];
            match task.state {
                Ts::Success | Ts::ForcedSuccess => {
                    let finished_at = task.end_time.unwrap_or(task.submit_time);
                    machine.outcomes.insert(node, NodeOutcome::Success { branch: task.branch.clone(), finished_at });
                }
                Ts::Killed => {
                    machine.failed.insert(node);
                }
                Ts::Failure if lifecycle.is_terminal(task) => {
                    machine.failed.insert(node);
                }
                _ => {}
            }
        }
        if machine.instance.state == Wf::ReadyStop {
            machine.stop_target = Some(Wf::Stop);
        }

        info!(
            workflow_instance_id = instance_id,
            state = %machine.instance.state,
            tasks = machine.tasks.len(),
            "Workflow instance restored"
        );
        Ok(machine)
    }

    pub fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    /// Latest task instance created for `task_code`.
    pub fn task_instance(&self, task_code: i64) -> Option<&TaskInstance> {
        self.graph.node_of(task_code).and_then(|node| self.tasks.get(&node))
    }

    /// Terminal, and no kill acknowledgement is outstanding.
    pub fn is_settled(&self) -> bool {
        self.instance.state.is_terminal() && !self.in_flight()
    }

    /// Effects left behind by an `apply` that returned an error.
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Apply one event.
    ///
    /// # Errors
    /// [`EngineError::InvalidTransition`] for commands the current state
    /// does not accept.  Worker reports that no longer apply are ignored.
    /// On error, effects produced before the failure stay available through
    /// [`Self::take_effects`].
    pub fn apply(&mut self, event: InstanceEvent) -> EngineResult<Vec<Effect>> {
        let now = Utc::now();
        match event {
            InstanceEvent::Start => self.start(now)?,
            InstanceEvent::TaskReport(report) => self.on_report(report, now)?,
            InstanceEvent::SlotGranted { task_instance_id } => self.on_slot_granted(task_instance_id, now)?,
            InstanceEvent::DispatchRejected { task_instance_id, reason } => {
                if let Some(node) = self.node_of_task(task_instance_id) {
                    warn!(task_instance_id, "Worker rejected task instance: {reason}");
                    let outcome = self.task_failed(node, reason, now);
                    ignore_stale(task_instance_id, outcome)?;
                }
            }
            InstanceEvent::Tick(at) => self.on_tick(at)?,
            InstanceEvent::Pause => self.pause(now)?,
            InstanceEvent::Stop => self.stop(Wf::Stop, now)?,
            InstanceEvent::Kill => self.stop(Wf::Kill, now)?,
            InstanceEvent::Resume => self.resume(now)?,
            InstanceEvent::RecoverFaultTolerance => self.recover(now)?,
            InstanceEvent::ForceTaskSuccess { task_instance_id } => self.force_task_success(task_instance_id, now)?,
            InstanceEvent::ForceSuccess => self.force_success(now)?,
        }
        Ok(std::mem::take(&mut self.effects))
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn start(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        if !matches!(self.instance.state, Wf::SubmittedSuccess | Wf::WaitingThread) {
            return Err(self.illegal("start"));
        }
        self.instance.start_time = Some(now);
        self.instance.host = Some(self.host.clone());
        self.set_state(Wf::RunningExecution, now)?;
        self.schedule(now)?;
        self.check_completion(now)
    }

    fn pause(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        if self.instance.state != Wf::RunningExecution {
            return Err(self.illegal("pause"));
        }
        for node in self.nodes() {
            let lifecycle = self.lifecycles[node];
            let Some(task) = self.tasks.get(&node) else { continue };
            if task.state == Ts::Submitted {
                self.transition_task(node, TaskEvent::Pause, now)?;
                self.release_slot(node)?;
            } else if lifecycle.awaiting_retry(task) {
                self.release_slot(node)?;
            }
        }
        let next = if self.in_flight() { Wf::ReadyPause } else { Wf::Pause };
        self.set_state(next, now)
    }

    fn resume(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        if !matches!(self.instance.state, Wf::Pause | Wf::ReadyPause) {
            return Err(self.illegal("resume"));
        }
        self.set_state(Wf::RunningExecution, now)?;
        for node in self.nodes() {
            if self.tasks.get(&node).is_some_and(|t| t.state == Ts::Paused) {
                self.transition_task(node, TaskEvent::Resume, now)?;
                self.admit(node, now)?;
            }
        }
        self.schedule(now)?;
        self.check_completion(now)
    }

    fn stop(&mut self, target: Wf, now: DateTime<Utc>) -> EngineResult<()> {
        let action = if target == Wf::Kill { "kill" } else { "stop" };
        match self.instance.state {
            state if state.is_terminal() => return Err(self.illegal(action)),
            Wf::ReadyStop => {
                if target == Wf::Kill {
                    self.stop_target = Some(Wf::Kill);
                }
                debug!(workflow_instance_id = self.instance.id, "Instance already stopping");
                return Ok(());
            }
            _ => {}
        }

        info!(workflow_instance_id = self.instance.id, action, "Stopping workflow instance");
        self.kill_outstanding(now)?;
        self.stop_target = Some(target);
        if self.in_flight() {
            self.set_state(Wf::ReadyStop, now)
        } else {
            self.finish(target, now)
        }
    }

    fn recover(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        if !matches!(self.instance.state, Wf::RunningExecution | Wf::ReadyPause) {
            return Err(self.illegal("recover"));
        }
        for node in self.nodes() {
            let in_flight = self.tasks.get(&node).is_some_and(|t| t.state.is_in_flight());
            if in_flight && !self.graph.task(node).is_sub_workflow() {
                self.transition_task(node, TaskEvent::Resubmit, now)?;
                self.admit(node, now)?;
            }
        }
        self.schedule(now)?;
        self.check_completion(now)
    }

    fn force_task_success(&mut self, task_instance_id: i64, now: DateTime<Utc>) -> EngineResult<()> {
        let node = self
            .node_of_task(task_instance_id)
            .ok_or(EngineError::TaskInstanceNotFound(task_instance_id))?;
        if self.instance.state.is_terminal() {
            return Err(self.illegal("force task success"));
        }

        let was_in_flight = self.tasks.get(&node).is_some_and(|t| t.state.is_in_flight());
        self.transition_task(node, TaskEvent::ForceSuccess, now)?;
        if was_in_flight {
            let sub_workflow = self.graph.task(node).is_sub_workflow();
            self.effects.push(Effect::KillTask { task_instance_id, sub_workflow });
        }

        warn!(
            workflow_instance_id = self.instance.id,
            task_instance_id,
            operator_override = true,
            "Task instance forced to success"
        );
        self.effects.push(Effect::Emit(EngineEvent::OverrideApplied {
            workflow_instance_id: self.instance.id,
            task_instance_id: Some(task_instance_id),
            action: "force task success".to_owned(),
            at: now,
        }));

        self.release_slot(node)?;
        self.failed.remove(&node);
        self.outcomes.insert(node, NodeOutcome::Success { branch: None, finished_at: now });
        self.schedule(now)?;
        self.check_completion(now)
    }

    fn force_success(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        if self.instance.state != Wf::Failure {
            return Err(self.illegal("force success"));
        }
        warn!(workflow_instance_id = self.instance.id, operator_override = true, "Workflow instance forced to success");

        self.instance.forced_success = true;
        self.set_state(Wf::Success, now)?;
        self.effects.push(Effect::Emit(EngineEvent::OverrideApplied {
            workflow_instance_id: self.instance.id,
            task_instance_id: None,
            action: "force success".to_owned(),
            at: now,
        }));
        self.effects.push(Effect::Finished(Wf::Success));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Worker feedback
    // -----------------------------------------------------------------------

    fn on_report(&mut self, report: TaskReport, now: DateTime<Utc>) -> EngineResult<()> {
        let task_instance_id = report.task_instance_id;
        let Some(node) = self.node_of_task(task_instance_id) else {
            debug!(task_instance_id, "Report for unknown task instance ignored");
            return Ok(());
        };
        let attempt = self.tasks.get(&node).map_or(0, |t| t.attempt);
        if attempt != report.attempt {
            debug!(task_instance_id, current = attempt, reported = report.attempt, "Stale attempt report ignored");
            return Ok(());
        }

        let outcome = match report.state {
            ReportedState::Running => self.task_started(node, report.host, now),
            ReportedState::Success { branch } => self.task_succeeded(node, branch, now),
            ReportedState::Failure { message } => self.task_failed(node, message, now),
            ReportedState::Killed => self.task_killed(node, now),
        };
        ignore_stale(task_instance_id, outcome)
    }

    fn on_slot_granted(&mut self, task_instance_id: i64, now: DateTime<Utc>) -> EngineResult<()> {
        let Some(node) = self.node_of_task(task_instance_id) else {
            return Ok(());
        };
        let holds_slot = self
            .tasks
            .get(&node)
            .is_some_and(|t| t.state == Ts::Submitted && !task_instance::needs_slot(t));
        if holds_slot && self.instance.state == Wf::RunningExecution {
            debug!(task_instance_id, "Promoted task dispatching");
            self.dispatch(node, now)?;
        } else {
            debug!(task_instance_id, "Slot grant no longer needed");
        }
        Ok(())
    }

    fn on_tick(&mut self, at: DateTime<Utc>) -> EngineResult<()> {
        if self.instance.state.is_active() {
            self.check_timeouts(at)?;
        }

        for node in self.nodes() {
            if self.instance.state != Wf::RunningExecution {
                break;
            }
            let lifecycle = self.lifecycles[node];
            let Some(task) = self.tasks.get(&node) else { continue };
            if lifecycle.retry_due(task, at) {
                info!(task_instance_id = task.id, next_attempt = task.attempt + 1, "Retrying task instance");
                self.transition_task(node, TaskEvent::Retry, at)?;
                self.admit(node, at)?;
            } else if task.state == Ts::Submitted && task_instance::needs_slot(task) {
                // Admission was refused earlier (quarantined group).
                self.admit(node, at)?;
            }
        }

        self.schedule(at)?;
        self.check_completion(at)
    }

    fn check_timeouts(&mut self, at: DateTime<Utc>) -> EngineResult<()> {
        if let (Some(minutes), Some(started)) = (self.instance.timeout_minutes, self.instance.start_time) {
            if !self.timeout_warned && started + Duration::minutes(i64::from(minutes)) <= at {
                self.timeout_warned = true;
                warn!(workflow_instance_id = self.instance.id, timeout_minutes = minutes, "Workflow instance timed out");
                self.effects.push(Effect::Emit(EngineEvent::WorkflowTimeoutWarning {
                    workflow_instance_id: self.instance.id,
                    at,
                }));
            }
        }

        for node in self.nodes() {
            let lifecycle = self.lifecycles[node];
            let Some(task) = self.tasks.get(&node) else { continue };
            let Some(policy) = lifecycle.timed_out(task, at) else { continue };
            let (task_instance_id, attempt, task_code) = (task.id, task.attempt, task.task_code);

            if policy.strategy.warns() && self.warned.insert((task_instance_id, attempt)) {
                warn!(task_instance_id, timeout_secs = policy.seconds, "Task instance exceeded its timeout");
                self.effects.push(Effect::Emit(EngineEvent::TaskTimeoutWarning {
                    workflow_instance_id: self.instance.id,
                    task_instance_id,
                    task_code,
                    at,
                }));
            }
            if policy.strategy.fails() {
                let sub_workflow = self.graph.task(node).is_sub_workflow();
                self.effects.push(Effect::KillTask { task_instance_id, sub_workflow });
                self.transition_task(node, TaskEvent::Fail, at)?;
                self.after_failure(node, format!("timed out after {}s", policy.seconds), at)?;
            }
        }
        Ok(())
    }

    fn task_started(&mut self, node: usize, host: Option<String>, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition_task(node, TaskEvent::Start, now)?;
        if let (Some(host), Some(task)) = (host, self.tasks.get_mut(&node)) {
            task.host = Some(host);
            task_repo::update_task_instance(&self.pool, task)?;
        }
        Ok(())
    }

    fn task_succeeded(&mut self, node: usize, branch: Option<String>, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition_task(node, TaskEvent::Succeed, now)?;
        if let Some(task) = self.tasks.get_mut(&node) {
            task.branch = branch.clone();
            task_repo::update_task_instance(&self.pool, task)?;
        }
        self.release_slot(node)?;
        self.outcomes.insert(node, NodeOutcome::Success { branch, finished_at: now });
        self.schedule(now)?;
        self.check_completion(now)
    }

    fn task_failed(&mut self, node: usize, message: String, now: DateTime<Utc>) -> EngineResult<()> {
        self.transition_task(node, TaskEvent::Fail, now)?;
        self.after_failure(node, message, now)
    }

    fn task_killed(&mut self, node: usize, now: DateTime<Utc>) -> EngineResult<()> {
        if let Some(task) = self.tasks.get(&node).filter(|t| t.state == Ts::Failure) {
            // Acknowledges the kill a timeout sent; the failure is already counted.
            debug!(task_instance_id = task.id, attempt = task.attempt, "Kill acknowledged for a failed attempt");
            return Ok(());
        }
        self.transition_task(node, TaskEvent::Kill, now)?;
        self.release_slot(node)?;

        if matches!(self.instance.state, Wf::RunningExecution | Wf::ReadyPause) {
            // Nobody asked for this kill; it counts as a failure.
            warn!(workflow_instance_id = self.instance.id, node, "Task instance killed outside of a stop");
            self.record_failure(node, now)
        } else {
            self.check_completion(now)
        }
    }

    fn after_failure(&mut self, node: usize, message: String, now: DateTime<Utc>) -> EngineResult<()> {
        let lifecycle = self.lifecycles[node];
        let running = self.instance.state;
        let Some(task) = self.tasks.get_mut(&node) else {
            return Ok(());
        };
        task.error_message = Some(message.clone());
        task_repo::update_task_instance(&self.pool, task)?;

        let retry = lifecycle.retries_remaining(task) && matches!(running, Wf::RunningExecution | Wf::ReadyPause);
        if retry {
            info!(
                task_instance_id = task.id,
                attempt = task.attempt,
                max_attempts = lifecycle.max_attempts,
                "Task attempt failed, will retry: {message}"
            );
            if running != Wf::RunningExecution {
                self.release_slot(node)?;
            }
            return self.check_completion(now);
        }

        warn!(task_instance_id = task.id, attempt = task.attempt, "Task instance failed: {message}");
        self.release_slot(node)?;
        self.record_failure(node, now)
    }

    /// A task ended badly for good; apply the failure strategy.
    fn record_failure(&mut self, node: usize, now: DateTime<Utc>) -> EngineResult<()> {
        self.failed.insert(node);
        if self.instance.first_failed_task.is_none() {
            self.instance.first_failed_task = self.tasks.get(&node).map(|t| t.id);
            instance_repo::update_instance(&self.pool, &self.instance)?;
        }

        let active = matches!(self.instance.state, Wf::RunningExecution | Wf::ReadyPause);
        if active && self.instance.failure_strategy == FailureStrategy::End {
            info!(workflow_instance_id = self.instance.id, "Failure strategy END: aborting workflow instance");
            self.kill_outstanding(now)?;
            return self.finish(Wf::Failure, now);
        }
        self.check_completion(now)
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    /// Create task instances for every ready node.
    fn schedule(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.delayed.clear();
        loop {
            if self.instance.state != Wf::RunningExecution {
                return Ok(());
            }
            let verdicts: Vec<(usize, Readiness)> = self
                .graph
                .evaluate(&self.scope, &self.outcomes)
                .into_iter()
                .filter(|(node, _)| !self.tasks.contains_key(node))
                .collect();

            let mut resolved = false;
            for (node, verdict) in verdicts {
                if self.instance.state != Wf::RunningExecution {
                    return Ok(());
                }
                match verdict {
                    Readiness::Bypass => {
                        debug!(task_code = self.graph.task(node).code, "Disabled task bypassed");
                        self.outcomes.insert(node, NodeOutcome::Bypassed { at: now });
                        resolved = true;
                    }
                    Readiness::Pruned => {
                        debug!(task_code = self.graph.task(node).code, "Task skipped by branch condition");
                        self.outcomes.insert(node, NodeOutcome::Pruned);
                        resolved = true;
                    }
                    Readiness::Ready { not_before: Some(due) } if due > now => {
                        self.delayed.insert(node, due);
                    }
                    Readiness::Ready { .. } => {
                        resolved |= self.create_task(node, now)?;
                    }
                }
            }
            if !resolved {
                return Ok(());
            }
        }
    }

    /// Returns `true` if the node resolved on the spot (dry run).
    fn create_task(&mut self, node: usize, now: DateTime<Utc>) -> EngineResult<bool> {
        let graph = Arc::clone(&self.graph);
        let definition = graph.task(node);
        let row = TaskInstance {
            id: 0,
            workflow_instance_id: self.instance.id,
            task_code: definition.code,
            task_version: definition.version,
            name: definition.name.clone(),
            task_type: definition.task_type.clone(),
            state: Ts::Submitted,
            attempt: 1,
            priority: definition.priority,
            worker_group: definition.worker_group.clone(),
            host: None,
            submit_time: now,
            start_time: None,
            end_time: None,
            task_group_id: definition.task_group_id,
            task_group_queue_id: None,
            queue_released: false,
            branch: None,
            error_message: None,
        };
        let task = task_repo::insert_task_instance(&self.pool, row)?;
        debug!(task_instance_id = task.id, task_code = task.task_code, "Task instance created");
        self.effects.push(Effect::Emit(task_changed(&task, None, now)));
        self.tasks.insert(node, task);

        if self.instance.dry_run {
            for event in [TaskEvent::Dispatch, TaskEvent::Start, TaskEvent::Succeed] {
                self.transition_task(node, event, now)?;
            }
            self.outcomes.insert(node, NodeOutcome::Success { branch: None, finished_at: now });
            return Ok(true);
        }

        self.admit(node, now)?;
        Ok(false)
    }

    /// Acquire a task group slot if needed, then dispatch.
    fn admit(&mut self, node: usize, now: DateTime<Utc>) -> EngineResult<()> {
        let Some(task) = self.tasks.get(&node) else {
            return Ok(());
        };
        if task.state != Ts::Submitted {
            return Ok(());
        }

        if let (true, Some(group_id)) = (task_instance::needs_slot(task), task.task_group_id) {
            let (task_instance_id, priority) = (task.id, task.priority);
            match self.registry.acquire(group_id, task_instance_id, self.instance.id, priority) {
                Ok(Admission::Granted(entry)) => self.assign_entry(node, entry.id)?,
                Ok(Admission::Queued(entry)) => {
                    return self.assign_entry(node, entry.id);
                }
                Err(e @ (EngineError::GroupQuarantined(_) | EngineError::CapacityExceeded { .. })) => {
                    warn!(task_instance_id, task_group_id = group_id, error = %e, "Task held back by its task group");
                    return Ok(());
                }
                Err(EngineError::TaskGroupNotFound(id)) => {
                    self.transition_task(node, TaskEvent::Dispatch, now)?;
                    return self.task_failed(node, format!("task group {id} does not exist"), now);
                }
                Err(other) => return Err(other),
            }
        }
        self.dispatch(node, now)
    }

    fn assign_entry(&mut self, node: usize, queue_id: i64) -> EngineResult<()> {
        if let Some(task) = self.tasks.get_mut(&node) {
            task_instance::assign_queue_entry(task, queue_id);
            task_repo::update_task_instance(&self.pool, task)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, node: usize, now: DateTime<Utc>) -> EngineResult<()> {
        let graph = Arc::clone(&self.graph);
        let definition = graph.task(node);
        self.transition_task(node, TaskEvent::Dispatch, now)?;
        let Some(task) = self.tasks.get(&node) else {
            return Ok(());
        };

        if definition.is_sub_workflow() {
            return match definition.sub_workflow_code() {
                Some(definition_code) => {
                    let task_instance = task.clone();
                    self.effects.push(Effect::StartSubWorkflow { task_instance, definition_code });
                    Ok(())
                }
                None => self.task_failed(node, "sub-workflow task names no processDefinitionCode".to_owned(), now),
            };
        }

        let dispatch = TaskDispatch {
            task_instance_id: task.id,
            workflow_instance_id: self.instance.id,
            task_code: task.task_code,
            task_type: task.task_type.clone(),
            params: definition.params.clone(),
            attempt: task.attempt,
            priority: task.priority,
            worker_group: task.worker_group.clone(),
            tenant: self.instance.tenant.clone(),
            environment_code: definition.environment_code.or(self.instance.environment_code),
            schedule_time: self.instance.schedule_time,
            variables: self.variables(),
            test_flag: self.instance.test_flag,
        };
        self.effects.push(Effect::Dispatch(dispatch));
        Ok(())
    }

    /// Global parameters overlaid with the run's start parameters.
    fn variables(&self) -> Value {
        let mut merged = serde_json::Map::new();
        for source in [&self.graph.definition().global_params, &self.instance.start_params] {
            if let Value::Object(map) = source {
                merged.extend(map.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }
        Value::Object(merged)
    }

    fn check_completion(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        let in_flight = self.in_flight();
        match self.instance.state {
            Wf::ReadyStop if !in_flight => {
                let target = self.stop_target.take().unwrap_or(Wf::Stop);
                self.finish(target, now)
            }
            Wf::ReadyPause if !in_flight => self.set_state(Wf::Pause, now),
            Wf::RunningExecution => {
                let live = in_flight
                    || !self.delayed.is_empty()
                    || self.tasks.iter().any(|(&node, t)| {
                        matches!(t.state, Ts::Submitted | Ts::Paused) || self.lifecycles[node].awaiting_retry(t)
                    });
                if live {
                    return Ok(());
                }
                let status = if self.failed.is_empty() { Wf::Success } else { Wf::Failure };
                self.finish(status, now)
            }
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// KILL in-flight tasks; kill everything not yet dispatched locally.
    fn kill_outstanding(&mut self, now: DateTime<Utc>) -> EngineResult<()> {
        self.delayed.clear();
        for node in self.nodes() {
            let lifecycle = self.lifecycles[node];
            let Some(task) = self.tasks.get(&node) else { continue };
            if task.state.is_in_flight() {
                let kill = Effect::KillTask {
                    task_instance_id: task.id,
                    sub_workflow: self.graph.task(node).is_sub_workflow(),
                };
                self.effects.push(kill);
            } else if matches!(task.state, Ts::Submitted | Ts::Paused) || lifecycle.awaiting_retry(task) {
                self.transition_task(node, TaskEvent::Kill, now)?;
                self.release_slot(node)?;
            }
        }
        Ok(())
    }

    fn finish(&mut self, status: Wf, now: DateTime<Utc>) -> EngineResult<()> {
        self.instance.end_time = Some(now);
        self.set_state(status, now)?;
        self.effects.push(Effect::Finished(status));
        Ok(())
    }

    fn set_state(&mut self, to: Wf, now: DateTime<Utc>) -> EngineResult<()> {
        let from = self.instance.state;
        instance_repo::compare_and_set_state(&self.pool, self.instance.id, from, to)?;
        self.instance.state = to;
        instance_repo::update_instance(&self.pool, &self.instance)?;

        info!(workflow_instance_id = self.instance.id, %from, %to, "Workflow instance transition");
        self.effects.push(Effect::Emit(EngineEvent::WorkflowInstanceStateChanged {
            workflow_instance_id: self.instance.id,
            definition_code: self.instance.definition_code,
            from,
            to,
            at: now,
        }));
        Ok(())
    }

    fn transition_task(&mut self, node: usize, event: TaskEvent, now: DateTime<Utc>) -> EngineResult<Ts> {
        let lifecycle = self.lifecycles[node];
        let code = self.graph.task(node).code;
        let task = self.tasks.get_mut(&node).ok_or(EngineError::TaskInstanceNotFound(code))?;

        let from = task.state;
        let to = lifecycle.apply(task, event, now)?;
        task_repo::update_task_instance(&self.pool, task)?;
        debug!(task_instance_id = task.id, %from, %to, "Task instance transition");

        let changed = task_changed(task, Some(from), now);
        self.effects.push(Effect::Emit(changed));
        Ok(to)
    }

    /// Give back the node's task group entry, at most once.
    fn release_slot(&mut self, node: usize) -> EngineResult<()> {
        let Some(task) = self.tasks.get_mut(&node) else {
            return Ok(());
        };
        let Some(queue_id) = task_instance::take_queue_release(task) else {
            return Ok(());
        };
        task_repo::update_task_instance(&self.pool, task)?;

        // Group-level faults quarantine the group, not this instance.
        match self.registry.release(queue_id) {
            Ok(promoted) if !promoted.is_empty() => self.effects.push(Effect::Promoted(promoted)),
            Ok(_) => {}
            Err(e) => error!(queue_id, error = %e, "Releasing task group slot failed"),
        }
        Ok(())
    }

    fn in_flight(&self) -> bool {
        self.tasks.values().any(|t| t.state.is_in_flight())
    }

    fn nodes(&self) -> Vec<usize> {
        self.tasks.keys().copied().collect()
    }

    fn node_of_task(&self, task_instance_id: i64) -> Option<usize> {
        self.tasks.iter().find(|(_, t)| t.id == task_instance_id).map(|(&node, _)| node)
    }

    fn illegal(&self, action: &'static str) -> EngineError {
        EngineError::invalid("workflow instance", self.instance.id, self.instance.state, action)
    }
}

fn task_changed(task: &TaskInstance, from: Option<Ts>, at: DateTime<Utc>) -> EngineEvent {
    EngineEvent::TaskInstanceStateChanged {
        workflow_instance_id: task.workflow_instance_id,
        task_instance_id: task.id,
        task_code: task.task_code,
        attempt: task.attempt,
        from,
        to: task.state,
        at,
    }
}

/// Reports racing with local transitions are expected; drop them.
fn ignore_stale(task_instance_id: i64, outcome: EngineResult<()>) -> EngineResult<()> {
    match outcome {
        Err(EngineError::InvalidTransition { state, action, .. }) => {
            debug!(task_instance_id, %state, action, "Task report does not apply, ignored");
            Ok(())
        }
        other => other,
    }
}

// ===========================================================================
// Unit tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::new_instance_row;
    use crate::models::{Command, TaskDefinition, TaskRelation, TimeoutStrategy, WorkflowDefinition};
    use db::create_pool;

    struct Harness {
        pool: DbPool,
        registry: Arc<AdmissionControllerRegistry>,
        config: EngineConfig,
    }

    impl Harness {
        fn new() -> Self {
            let pool = create_pool();
            Self {
                registry: Arc::new(AdmissionControllerRegistry::new(pool.clone())),
                pool,
                config: EngineConfig { default_retry_interval: std::time::Duration::ZERO, ..EngineConfig::default() },
            }
        }

        fn machine(&self, definition: WorkflowDefinition, command: Command) -> WorkflowInstanceMachine {
            let graph = Arc::new(WorkflowGraph::build(definition).unwrap());
            let row = new_instance_row(&command, graph.definition(), "default".into(), None);
            let row = instance_repo::insert_instance(&self.pool, row).unwrap();
            WorkflowInstanceMachine::new(self.pool.clone(), self.registry.clone(), graph, row, &self.config).unwrap()
        }
    }

    fn shell(code: i64) -> TaskDefinition {
        TaskDefinition::new(code, format!("task-{code}"), "SHELL")
    }

    /// A -> B, A -> C
    fn fan_out() -> WorkflowDefinition {
        WorkflowDefinition::new(
            100,
            "fan-out",
            vec![shell(1), shell(2), shell(3)],
            vec![TaskRelation::new(1, 2), TaskRelation::new(1, 3)],
        )
    }

    fn chain(tasks: Vec<TaskDefinition>) -> WorkflowDefinition {
        let relations = tasks.windows(2).map(|w| TaskRelation::new(w[0].code, w[1].code)).collect();
        WorkflowDefinition::new(200, "chain", tasks, relations)
    }

    fn dispatched(effects: &[Effect]) -> Vec<i64> {
        let mut codes: Vec<i64> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Dispatch(d) => Some(d.task_code),
                _ => None,
            })
            .collect();
        codes.sort_unstable();
        codes
    }

    fn kills(effects: &[Effect]) -> Vec<i64> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::KillTask { task_instance_id, .. } => Some(*task_instance_id),
                _ => None,
            })
            .collect()
    }

    fn finished(effects: &[Effect]) -> Option<Wf> {
        effects.iter().find_map(|e| match e {
            Effect::Finished(status) => Some(*status),
            _ => None,
        })
    }

    fn report(m: &mut WorkflowInstanceMachine, code: i64, state: ReportedState) -> Vec<Effect> {
        let task = m.task_instance(code).unwrap();
        let report = TaskReport::new(task.id, task.attempt, state);
        m.apply(InstanceEvent::TaskReport(report)).unwrap()
    }

    fn success() -> ReportedState {
        ReportedState::Success { branch: None }
    }

    fn failure() -> ReportedState {
        ReportedState::Failure { message: "exit code 1".into() }
    }

    fn task_id(m: &WorkflowInstanceMachine, code: i64) -> i64 {
        m.task_instance(code).unwrap().id
    }

    #[test]
    fn end_strategy_kills_siblings_and_fails_at_once() {
        let h = Harness::new();
        let mut m = h.machine(fan_out(), Command::start(100).with_failure_strategy(FailureStrategy::End));

        assert_eq!(dispatched(&m.apply(InstanceEvent::Start).unwrap()), vec![1]);
        assert_eq!(dispatched(&report(&mut m, 1, success())), vec![2, 3]);

        let effects = report(&mut m, 2, failure());
        assert_eq!(kills(&effects), vec![task_id(&m, 3)]);
        assert_eq!(finished(&effects), Some(Wf::Failure));
        assert_eq!(m.instance().first_failed_task, Some(task_id(&m, 2)));
        assert!(!m.is_settled());

        report(&mut m, 3, ReportedState::Killed);
        assert_eq!(m.task_instance(3).unwrap().state, Ts::Killed);
        assert!(m.is_settled());
        assert_eq!(instance_repo::get_instance(&h.pool, m.instance().id).unwrap().state, Wf::Failure);
    }

    #[test]
    fn end_strategy_never_creates_downstream_tasks() {
        let h = Harness::new();
        let mut m = h.machine(chain(vec![shell(1), shell(2), shell(3)]), Command::start(200));

        m.apply(InstanceEvent::Start).unwrap();
        report(&mut m, 1, success());
        let effects = report(&mut m, 2, failure());

        assert_eq!(finished(&effects), Some(Wf::Failure));
        assert!(m.task_instance(3).is_none());
    }

    #[test]
    fn continue_strategy_lets_independent_branches_finish() {
        let h = Harness::new();
        let mut m = h.machine(fan_out(), Command::start(100).with_failure_strategy(FailureStrategy::Continue));

        m.apply(InstanceEvent::Start).unwrap();
        report(&mut m, 1, success());

        let effects = report(&mut m, 2, failure());
        assert!(kills(&effects).is_empty());
        assert_eq!(finished(&effects), None);

        let effects = report(&mut m, 3, success());
        assert_eq!(finished(&effects), Some(Wf::Failure));
        assert_eq!(m.task_instance(3).unwrap().state, Ts::Success);
    }

    #[test]
    fn stop_waits_for_every_kill_acknowledgement() {
        let h = Harness::new();
        let definition = WorkflowDefinition::new(300, "pair", vec![shell(1), shell(2)], vec![]);
        let mut m = h.machine(definition, Command::start(300));

        m.apply(InstanceEvent::Start).unwrap();
        report(&mut m, 1, ReportedState::Running);
        report(&mut m, 2, ReportedState::Running);

        let effects = m.apply(InstanceEvent::Stop).unwrap();
        let mut killed = kills(&effects);
        killed.sort_unstable();
        assert_eq!(killed, vec![task_id(&m, 1), task_id(&m, 2)]);
        assert_eq!(m.instance().state, Wf::ReadyStop);

        let effects = report(&mut m, 1, ReportedState::Killed);
        assert_eq!(finished(&effects), None);
        assert_eq!(m.instance().state, Wf::ReadyStop);

        let effects = report(&mut m, 2, ReportedState::Killed);
        assert_eq!(finished(&effects), Some(Wf::Stop));
        assert!(m.is_settled());
    }

    #[test]
    fn pause_lets_in_flight_work_finish_then_resume_continues() {
        let h = Harness::new();
        let mut m = h.machine(chain(vec![shell(1), shell(2)]), Command::start(200));

        m.apply(InstanceEvent::Start).unwrap();
        m.apply(InstanceEvent::Pause).unwrap();
        assert_eq!(m.instance().state, Wf::ReadyPause);

        let effects = report(&mut m, 1, success());
        assert!(dispatched(&effects).is_empty());
        assert_eq!(m.instance().state, Wf::Pause);

        let effects = m.apply(InstanceEvent::Resume).unwrap();
        assert_eq!(dispatched(&effects), vec![2]);
        assert_eq!(finished(&report(&mut m, 2, success())), Some(Wf::Success));
    }

    #[test]
    fn failed_attempt_retries_on_tick_and_stale_reports_are_ignored() {
        let h = Harness::new();
        let definition = chain(vec![shell(1).with_retries(1, 0)]);
        let mut m = h.machine(definition, Command::start(200));

        m.apply(InstanceEvent::Start).unwrap();
        let effects = report(&mut m, 1, failure());
        assert_eq!(finished(&effects), None);
        assert_eq!(m.task_instance(1).unwrap().state, Ts::Failure);

        let effects = m.apply(InstanceEvent::Tick(Utc::now())).unwrap();
        assert_eq!(dispatched(&effects), vec![1]);
        assert_eq!(m.task_instance(1).unwrap().attempt, 2);

        let stale = TaskReport::new(task_id(&m, 1), 1, success());
        assert!(m.apply(InstanceEvent::TaskReport(stale)).unwrap().is_empty());
        assert_eq!(m.task_instance(1).unwrap().state, Ts::Dispatched);

        assert_eq!(finished(&report(&mut m, 1, success())), Some(Wf::Success));
    }

    #[test]
    fn branch_conditions_prune_the_other_side() {
        let h = Harness::new();
        let definition = WorkflowDefinition::new(
            400,
            "branching",
            vec![shell(1), shell(2), shell(3)],
            vec![TaskRelation::new(1, 2).on_branch("yes"), TaskRelation::new(1, 3).on_branch("no")],
        );
        let mut m = h.machine(definition, Command::start(400));

        m.apply(InstanceEvent::Start).unwrap();
        let effects = report(&mut m, 1, ReportedState::Success { branch: Some("yes".into()) });
        assert_eq!(dispatched(&effects), vec![2]);

        assert_eq!(finished(&report(&mut m, 2, success())), Some(Wf::Success));
        assert!(m.task_instance(3).is_none());
    }

    #[test]
    fn delay_edges_hold_the_successor_until_due() {
        let h = Harness::new();
        let definition = WorkflowDefinition::new(
            500,
            "delayed",
            vec![shell(1), shell(2)],
            vec![TaskRelation::new(1, 2).delayed(60)],
        );
        let mut m = h.machine(definition, Command::start(500));

        m.apply(InstanceEvent::Start).unwrap();
        let effects = report(&mut m, 1, success());
        assert!(dispatched(&effects).is_empty());
        assert_eq!(finished(&effects), None);

        let effects = m.apply(InstanceEvent::Tick(Utc::now() + Duration::seconds(61))).unwrap();
        assert_eq!(dispatched(&effects), vec![2]);
    }

    #[test]
    fn dry_run_resolves_without_dispatching() {
        let h = Harness::new();
        let mut m = h.machine(fan_out(), Command::start(100).dry_run());

        let effects = m.apply(InstanceEvent::Start).unwrap();
        assert!(dispatched(&effects).is_empty());
        assert_eq!(finished(&effects), Some(Wf::Success));
        assert!((1..=3).all(|code| m.task_instance(code).unwrap().state == Ts::Success));
    }

    #[test]
    fn disabled_tasks_are_bypassed() {
        let h = Harness::new();
        let mut m = h.machine(chain(vec![shell(1), shell(2).disabled(), shell(3)]), Command::start(200));

        m.apply(InstanceEvent::Start).unwrap();
        assert_eq!(dispatched(&report(&mut m, 1, success())), vec![3]);
        assert!(m.task_instance(2).is_none());
    }

    #[test]
    fn task_group_slot_passes_to_the_queued_task() {
        let h = Harness::new();
        let group = h.registry.create_group("db", 0, 1).unwrap().id;
        let definition = WorkflowDefinition::new(
            600,
            "grouped",
            vec![shell(1).in_task_group(group), shell(2).in_task_group(group)],
            vec![],
        );
        let mut m = h.machine(definition, Command::start(600));

        assert_eq!(dispatched(&m.apply(InstanceEvent::Start).unwrap()), vec![1]);
        let queued = task_id(&m, 2);

        let effects = report(&mut m, 1, success());
        let promoted: Vec<i64> = effects
            .iter()
            .filter_map(|e| match e {
                Effect::Promoted(entries) => Some(entries.iter().map(|q| q.task_instance_id).collect::<Vec<_>>()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(promoted, vec![queued]);

        let effects = m.apply(InstanceEvent::SlotGranted { task_instance_id: queued }).unwrap();
        assert_eq!(dispatched(&effects), vec![2]);

        report(&mut m, 2, success());
        assert_eq!(h.registry.snapshot(group).unwrap().running, 0);
    }

    #[test]
    fn force_task_success_bypasses_retry_and_is_reported() {
        let h = Harness::new();
        let mut m = h.machine(chain(vec![shell(1).with_retries(3, 3600)]), Command::start(200));

        m.apply(InstanceEvent::Start).unwrap();
        report(&mut m, 1, failure());

        let effects = m.apply(InstanceEvent::ForceTaskSuccess { task_instance_id: task_id(&m, 1) }).unwrap();
        assert_eq!(finished(&effects), Some(Wf::Success));
        assert!(effects.iter().any(|e| matches!(e, Effect::Emit(EngineEvent::OverrideApplied { .. }))));
        assert_eq!(m.task_instance(1).unwrap().state, Ts::ForcedSuccess);
    }

    #[test]
    fn force_success_only_overrides_failure() {
        let h = Harness::new();
        let mut m = h.machine(chain(vec![shell(1)]), Command::start(200));

        m.apply(InstanceEvent::Start).unwrap();
        report(&mut m, 1, failure());
        assert_eq!(m.instance().state, Wf::Failure);

        let effects = m.apply(InstanceEvent::ForceSuccess).unwrap();
        assert_eq!(finished(&effects), Some(Wf::Success));
        assert!(m.instance().forced_success);

        assert!(matches!(m.apply(InstanceEvent::ForceSuccess), Err(EngineError::InvalidTransition { .. })));
    }

    #[test]
    fn commands_on_terminal_instances_are_rejected() {
        let h = Harness::new();
        let mut m = h.machine(chain(vec![shell(1)]), Command::start(200));

        m.apply(InstanceEvent::Start).unwrap();
        report(&mut m, 1, success());

        for event in [InstanceEvent::Pause, InstanceEvent::Stop, InstanceEvent::Start, InstanceEvent::Resume] {
            assert!(matches!(m.apply(event), Err(EngineError::InvalidTransition { .. })));
        }
    }

    #[test]
    fn timeouts_warn_once_and_fail_when_configured() {
        let h = Harness::new();
        let definition = WorkflowDefinition::new(
            700,
            "slow",
            vec![
                shell(1).with_timeout(1, TimeoutStrategy::Warn),
                shell(2).with_timeout(1, TimeoutStrategy::Fail),
            ],
            vec![],
        );
        let mut m = h.machine(definition, Command::start(700).with_failure_strategy(FailureStrategy::Continue));

        m.apply(InstanceEvent::Start).unwrap();
        report(&mut m, 1, ReportedState::Running);
        report(&mut m, 2, ReportedState::Running);

        let later = Utc::now() + Duration::seconds(5);
        let effects = m.apply(InstanceEvent::Tick(later)).unwrap();
        let warnings = effects
            .iter()
            .filter(|e| matches!(e, Effect::Emit(EngineEvent::TaskTimeoutWarning { .. })))
            .count();
        assert_eq!(warnings, 1);
        assert_eq!(kills(&effects), vec![task_id(&m, 2)]);
        assert_eq!(m.task_instance(2).unwrap().state, Ts::Failure);

        let effects = m.apply(InstanceEvent::Tick(later)).unwrap();
        assert!(!effects.iter().any(|e| matches!(e, Effect::Emit(EngineEvent::TaskTimeoutWarning { .. }))));

        assert_eq!(finished(&report(&mut m, 1, success())), Some(Wf::Failure));
    }

    #[test]
    fn timeout_consumes_one_retry_and_the_kill_ack_is_absorbed() {
        let h = Harness::new();
        let definition = chain(vec![shell(1).with_retries(2, 60).with_timeout(1, TimeoutStrategy::Fail)]);
        let mut m = h.machine(definition, Command::start(200).with_failure_strategy(FailureStrategy::End));

        m.apply(InstanceEvent::Start).unwrap();
        report(&mut m, 1, ReportedState::Running);

        let later = Utc::now() + Duration::seconds(5);
        let effects = m.apply(InstanceEvent::Tick(later)).unwrap();
        assert_eq!(kills(&effects), vec![task_id(&m, 1)]);
        assert_eq!(m.task_instance(1).unwrap().state, Ts::Failure);

        let effects = report(&mut m, 1, ReportedState::Killed);
        assert_eq!(finished(&effects), None);
        assert_eq!(m.task_instance(1).unwrap().state, Ts::Failure);
        assert_eq!(m.instance().state, Wf::RunningExecution);

        // Not due before the retry interval elapses.
        assert!(dispatched(&m.apply(InstanceEvent::Tick(later)).unwrap()).is_empty());

        let effects = m.apply(InstanceEvent::Tick(later + Duration::seconds(61))).unwrap();
        assert_eq!(dispatched(&effects), vec![1]);
        assert_eq!(m.task_instance(1).unwrap().attempt, 2);
        assert_eq!(finished(&report(&mut m, 1, success())), Some(Wf::Success));
    }

    #[test]
    fn restored_machine_resubmits_in_flight_tasks() {
        let h = Harness::new();
        let mut m = h.machine(fan_out(), Command::start(100));
        m.apply(InstanceEvent::Start).unwrap();
        report(&mut m, 1, success());
        let id = m.instance().id;
        let graph = Arc::clone(m.graph());
        drop(m);

        let mut restored =
            WorkflowInstanceMachine::restore(h.pool.clone(), h.registry.clone(), graph, id, &h.config).unwrap();
        assert_eq!(restored.task_instance(1).unwrap().state, Ts::Success);

        let effects = restored.apply(InstanceEvent::RecoverFaultTolerance).unwrap();
        assert_eq!(dispatched(&effects), vec![2, 3]);
        assert!(effects.iter().all(|e| !matches!(e, Effect::Dispatch(d) if d.attempt != 1)));
    }

    #[test]
    fn dispatch_carries_merged_variables() {
        let h = Harness::new();
        let mut definition = chain(vec![shell(1)]);
        definition.global_params = serde_json::json!({"env": "prod", "day": "x"});
        let mut command = Command::start(200);
        command.start_params = serde_json::json!({"day": "2024-01-01"});
        let mut m = h.machine(definition, command);

        let effects = m.apply(InstanceEvent::Start).unwrap();
        let Some(Effect::Dispatch(d)) = effects.iter().find(|e| matches!(e, Effect::Dispatch(_))) else {
            panic!("no dispatch");
        };
        assert_eq!(d.variables, serde_json::json!({"env": "prod", "day": "2024-01-01"}));
    }
}
