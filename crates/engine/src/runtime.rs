//! Async driver.
//!
//! [`Runtime`] owns everything the state machines need and carries out
//! their effects:
//!
//! - every resident workflow instance has a mailbox and a driver task that
//!   applies its events strictly in order;
//! - worker submissions and kill requests go to the [`TaskExecutor`];
//! - task group promotions are routed to the owning instances;
//! - terminal instances hand over their serial lane, advance their backfill
//!   and report to their parent sub-workflow task.
//!
//! An instance without a driver (never started, or settled) is restored
//! from the store the first time an event is posted to it.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use db::models::{TaskGroupQueue, TaskGroupStatus, TaskInstance, WorkflowExecutionStatus as Wf, WorkflowInstance};
use db::repository::{task_instances as task_repo, workflow_instances as instance_repo};
use db::{DbError, DbPool};
use worker::{ReportedState, TaskExecutor, TaskReport};

use crate::complement::ComplementRun;
use crate::config::EngineConfig;
use crate::dispatcher::{CommandDispatcher, DefinitionCatalog, DispatchOutcome};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EventBus};
use crate::models::{Command, CommandKind};
use crate::task_group::{AdmissionControllerRegistry, GroupSnapshot};
use crate::workflow_instance::{Effect, InstanceEvent, WorkflowInstanceMachine};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

type DriverFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Envelope {
    event: InstanceEvent,
    reply: Option<oneshot::Sender<EngineResult<()>>>,
}

impl Envelope {
    fn event(event: InstanceEvent) -> Self {
        Self { event, reply: None }
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Handle to the engine.  Cheap to clone.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    pool: DbPool,
    config: EngineConfig,
    registry: Arc<AdmissionControllerRegistry>,
    dispatcher: CommandDispatcher,
    executor: Arc<dyn TaskExecutor>,
    events: EventBus,
    mailboxes: Mutex<HashMap<i64, mpsc::UnboundedSender<Envelope>>>,
    complements: Mutex<HashMap<Uuid, ComplementRun>>,
    /// Parent task instance id -> child workflow instance id.
    children: Mutex<HashMap<i64, i64>>,
}

impl Runtime {
    pub fn new(
        pool: DbPool,
        catalog: Arc<dyn DefinitionCatalog>,
        executor: Arc<dyn TaskExecutor>,
        config: EngineConfig,
    ) -> Self {
        let registry = Arc::new(AdmissionControllerRegistry::new(pool.clone()));
        let dispatcher = CommandDispatcher::new(pool.clone(), catalog, &config);
        let events = EventBus::new(config.event_buffer);
        Self {
            inner: Arc::new(Inner {
                pool,
                config,
                registry,
                dispatcher,
                executor,
                events,
                mailboxes: Mutex::new(HashMap::new()),
                complements: Mutex::new(HashMap::new()),
                children: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.inner.pool
    }

    pub fn registry(&self) -> &AdmissionControllerRegistry {
        &self.inner.registry
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.inner.dispatcher
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Dispatch a command and start whatever it created.
    ///
    /// Returns the instances the command created or targeted.
    #[instrument(skip_all, fields(command_id = %command.id))]
    pub async fn submit(&self, command: Command) -> EngineResult<Vec<WorkflowInstance>> {
        let outcome = self.inner.dispatcher.dispatch(&command)?;
        self.inner.act(outcome).await
    }

    /// Put a command on the durable queue; see [`Self::drain_commands`].
    pub fn enqueue(&self, command: &Command) -> EngineResult<Uuid> {
        self.inner.dispatcher.enqueue(command)
    }

    /// Rebuild serial lanes from the store after a restart and start the
    /// waiting instances that inherit an empty lane.  Call before
    /// submitting new commands.
    pub fn recover_serial_lanes(&self) -> usize {
        let handed_over = self.inner.dispatcher.recover_serial_lanes();
        for &instance_id in &handed_over {
            self.inner.post_or_log(instance_id, InstanceEvent::Start);
        }
        handed_over.len()
    }

    /// Consume every pending queued command.  Returns how many were taken.
    pub async fn drain_commands(&self) -> usize {
        let mut handled = 0;
        while let Some(result) = self.inner.dispatcher.consume_next() {
            handled += 1;
            // Rejections were recorded on the command row already.
            if let Ok(outcome) = result {
                if let Err(e) = self.inner.act(outcome).await {
                    warn!(error = %e, "Queued command could not be carried out");
                }
            }
        }
        handled
    }

    pub async fn pause(&self, instance_id: i64) -> EngineResult<WorkflowInstance> {
        self.command_for(instance_id, CommandKind::Pause { instance_id }).await
    }

    pub async fn stop(&self, instance_id: i64) -> EngineResult<WorkflowInstance> {
        self.command_for(instance_id, CommandKind::Stop { instance_id }).await
    }

    pub async fn resume(&self, instance_id: i64) -> EngineResult<WorkflowInstance> {
        self.command_for(instance_id, CommandKind::RecoverSuspendedProcess { instance_id }).await
    }

    /// Operator override for one task instance.
    pub async fn force_task_success(&self, task_instance_id: i64) -> EngineResult<()> {
        let task = task_repo::get_task_instance(&self.inner.pool, task_instance_id).map_err(|e| match e {
            DbError::NotFound { .. } => EngineError::TaskInstanceNotFound(task_instance_id),
            other => other.into(),
        })?;
        self.inner
            .deliver(task.workflow_instance_id, InstanceEvent::ForceTaskSuccess { task_instance_id })
            .await
    }

    /// Operator override: a FAILURE instance becomes SUCCESS.
    pub async fn force_success(&self, instance_id: i64) -> EngineResult<()> {
        self.inner.deliver(instance_id, InstanceEvent::ForceSuccess).await
    }

    async fn command_for(&self, instance_id: i64, kind: CommandKind) -> EngineResult<WorkflowInstance> {
        let instance = self.instance(instance_id)?;
        let instances = self.submit(Command::new(instance.definition_code, kind)).await?;
        instances.into_iter().next().ok_or(EngineError::InstanceNotFound(instance_id))
    }

    // -----------------------------------------------------------------------
    // Worker feedback and timers
    // -----------------------------------------------------------------------

    /// Route a worker report to the instance owning the task.
    pub fn report(&self, report: TaskReport) -> EngineResult<()> {
        let task = task_repo::get_task_instance(&self.inner.pool, report.task_instance_id).map_err(|e| match e {
            DbError::NotFound { .. } => EngineError::TaskInstanceNotFound(report.task_instance_id),
            other => other.into(),
        })?;
        self.inner.post(task.workflow_instance_id, Envelope::event(InstanceEvent::TaskReport(report)))
    }

    /// Feed reports from a worker channel until it closes.
    pub fn spawn_report_listener(&self, mut reports: mpsc::Receiver<TaskReport>) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            while let Some(report) = reports.recv().await {
                let task_instance_id = report.task_instance_id;
                if let Err(e) = runtime.report(report) {
                    warn!(task_instance_id, error = %e, "Dropping worker report");
                }
            }
            debug!("Report channel closed");
        })
    }

    /// Fire timers on every resident instance.
    pub fn tick(&self, now: DateTime<Utc>) {
        let senders: Vec<_> = self.inner.mailboxes.lock().values().cloned().collect();
        for sender in senders {
            if sender.send(Envelope::event(InstanceEvent::Tick(now))).is_err() {
                trace!("Tick for a retired instance dropped");
            }
        }
    }

    /// Periodically drain the command queue and fire timers.
    pub fn spawn_ticker(&self) -> JoinHandle<()> {
        let runtime = self.clone();
        let period = self.inner.config.tick_interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                runtime.drain_commands().await;
                runtime.tick(Utc::now());
            }
        })
    }

    // -----------------------------------------------------------------------
    // Task groups
    // -----------------------------------------------------------------------

    pub fn force_release(&self, task_group_id: i64) -> EngineResult<()> {
        let promoted = self.inner.registry.force_release(task_group_id)?;
        self.inner.grant(promoted, None);
        Ok(())
    }

    pub fn clear_quarantine(&self, task_group_id: i64) -> EngineResult<()> {
        let promoted = self.inner.registry.clear_quarantine(task_group_id)?;
        self.inner.grant(promoted, None);
        Ok(())
    }

    pub fn update_capacity(&self, task_group_id: i64, group_size: u32) -> EngineResult<()> {
        let promoted = self.inner.registry.update_capacity(task_group_id, group_size)?;
        self.inner.grant(promoted, None);
        Ok(())
    }

    pub fn set_group_status(&self, task_group_id: i64, status: TaskGroupStatus) -> EngineResult<()> {
        let promoted = self.inner.registry.set_status(task_group_id, status)?;
        self.inner.grant(promoted, None);
        Ok(())
    }

    pub fn group_snapshot(&self, task_group_id: i64) -> EngineResult<GroupSnapshot> {
        self.inner.registry.snapshot(task_group_id)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn instance(&self, instance_id: i64) -> EngineResult<WorkflowInstance> {
        self.inner.load(instance_id)
    }

    pub fn task_instances(&self, instance_id: i64) -> Vec<TaskInstance> {
        task_repo::list_by_workflow_instance(&self.inner.pool, instance_id)
    }

    /// Snapshot of an unfinished backfill.
    pub fn complement(&self, complement_id: Uuid) -> Option<ComplementRun> {
        self.inner.complements.lock().get(&complement_id).cloned()
    }

    /// Poll the store until the instance's state satisfies `accept`.
    pub async fn await_state(
        &self,
        instance_id: i64,
        accept: impl Fn(Wf) -> bool,
        within: Duration,
    ) -> EngineResult<WorkflowInstance> {
        let started = tokio::time::Instant::now();
        loop {
            let instance = self.instance(instance_id)?;
            if accept(instance.state) {
                return Ok(instance);
            }
            if started.elapsed() >= within {
                return Err(EngineError::WaitTimedOut {
                    id: instance_id,
                    state: instance.state.to_string(),
                    waited_ms: within.as_millis(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Drivers
// ---------------------------------------------------------------------------

/// Apply events to one instance until it settles.
fn drive(inner: Arc<Inner>, mut machine: WorkflowInstanceMachine, mut mailbox: mpsc::UnboundedReceiver<Envelope>) -> DriverFuture {
    Box::pin(async move {
        let instance_id = machine.instance().id;
        debug!(workflow_instance_id = instance_id, "Driver started");

        while let Some(envelope) = mailbox.recv().await {
            inner.step(&mut machine, envelope).await;
            if machine.is_settled() {
                for envelope in inner.retire(instance_id, &mut mailbox) {
                    inner.step(&mut machine, envelope).await;
                }
                break;
            }
        }
        debug!(workflow_instance_id = instance_id, state = %machine.instance().state, "Driver finished");
    })
}

impl Inner {
    fn load(&self, instance_id: i64) -> EngineResult<WorkflowInstance> {
        instance_repo::get_instance(&self.pool, instance_id).map_err(|e| match e {
            DbError::NotFound { .. } => EngineError::InstanceNotFound(instance_id),
            other => other.into(),
        })
    }

    fn restore(&self, instance_id: i64) -> EngineResult<WorkflowInstanceMachine> {
        let instance = self.load(instance_id)?;
        let graph = self.dispatcher.graph(instance.definition_code, instance.definition_version)?;
        WorkflowInstanceMachine::restore(self.pool.clone(), Arc::clone(&self.registry), graph, instance_id, &self.config)
    }

    /// Queue an event, starting a driver if the instance has none.
    fn post(self: &Arc<Self>, instance_id: i64, envelope: Envelope) -> EngineResult<()> {
        let mut mailboxes = self.mailboxes.lock();
        let envelope = match mailboxes.get(&instance_id) {
            Some(sender) => match sender.send(envelope) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(returned)) => returned,
            },
            None => envelope,
        };

        let machine = self.restore(instance_id)?;
        let (sender, mailbox) = mpsc::unbounded_channel();
        sender.send(envelope).map_err(|_| EngineError::DriverGone(instance_id))?;
        mailboxes.insert(instance_id, sender);
        tokio::spawn(drive(Arc::clone(self), machine, mailbox));
        Ok(())
    }

    fn post_or_log(self: &Arc<Self>, instance_id: i64, event: InstanceEvent) {
        if let Err(e) = self.post(instance_id, Envelope::event(event)) {
            error!(workflow_instance_id = instance_id, error = %e, "Could not deliver event");
        }
    }

    /// Post and wait until the event was applied.
    async fn deliver(self: &Arc<Self>, instance_id: i64, event: InstanceEvent) -> EngineResult<()> {
        let (reply, answer) = oneshot::channel();
        self.post(instance_id, Envelope { event, reply: Some(reply) })?;
        answer.await.map_err(|_| EngineError::DriverGone(instance_id))?
    }

    /// Detach a settled instance's mailbox and hand back what is still queued.
    fn retire(&self, instance_id: i64, mailbox: &mut mpsc::UnboundedReceiver<Envelope>) -> Vec<Envelope> {
        self.mailboxes.lock().remove(&instance_id);
        mailbox.close();
        let mut leftover = Vec::new();
        while let Ok(envelope) = mailbox.try_recv() {
            leftover.push(envelope);
        }
        leftover
    }

    async fn step(self: &Arc<Self>, machine: &mut WorkflowInstanceMachine, envelope: Envelope) {
        let Envelope { event, reply } = envelope;
        let instance_id = machine.instance().id;
        let mut outcome: Option<EngineResult<()>> = None;
        let mut pending = VecDeque::from([event]);

        while let Some(event) = pending.pop_front() {
            let effects = match machine.apply(event) {
                Ok(effects) => {
                    outcome.get_or_insert(Ok(()));
                    effects
                }
                Err(e) => {
                    if outcome.is_none() && reply.is_some() {
                        outcome = Some(Err(e));
                    } else {
                        warn!(workflow_instance_id = instance_id, error = %e, "Event rejected");
                        outcome.get_or_insert(Ok(()));
                    }
                    machine.take_effects()
                }
            };
            for effect in effects {
                self.handle(machine, effect, &mut pending).await;
            }
        }

        if let Some(reply) = reply {
            if reply.send(outcome.unwrap_or(Ok(()))).is_err() {
                debug!(workflow_instance_id = instance_id, "Caller stopped waiting");
            }
        }
    }

    async fn handle(
        self: &Arc<Self>,
        machine: &WorkflowInstanceMachine,
        effect: Effect,
        pending: &mut VecDeque<InstanceEvent>,
    ) {
        match effect {
            Effect::Dispatch(dispatch) => {
                let task_instance_id = dispatch.task_instance_id;
                if let Err(e) = self.executor.submit(dispatch).await {
                    pending.push_back(InstanceEvent::DispatchRejected { task_instance_id, reason: e.to_string() });
                }
            }
            Effect::KillTask { task_instance_id, sub_workflow: false } => {
                if let Err(e) = self.executor.kill(task_instance_id).await {
                    warn!(task_instance_id, error = %e, "Kill request failed");
                }
            }
            Effect::KillTask { task_instance_id, sub_workflow: true } => self.kill_child(task_instance_id, pending),
            Effect::StartSubWorkflow { task_instance, definition_code } => {
                self.start_child(machine.instance(), &task_instance, definition_code, pending)
            }
            Effect::Promoted(entries) => self.grant(entries, Some((machine.instance().id, pending))),
            Effect::Emit(event) => self.events.publish(event),
            Effect::Finished(status) => self.on_finished(machine.instance(), status),
        }
    }

    /// Tell the owners of promoted entries they may dispatch.
    fn grant(self: &Arc<Self>, entries: Vec<TaskGroupQueue>, mut own: Option<(i64, &mut VecDeque<InstanceEvent>)>) {
        for entry in entries {
            let event = InstanceEvent::SlotGranted { task_instance_id: entry.task_instance_id };
            match own.as_mut() {
                Some((id, pending)) if *id == entry.workflow_instance_id => pending.push_back(event),
                _ => self.post_or_log(entry.workflow_instance_id, event),
            }
        }
    }

    fn start_if_ready(self: &Arc<Self>, instance: &WorkflowInstance) {
        if instance.state == Wf::SubmittedSuccess {
            self.post_or_log(instance.id, InstanceEvent::Start);
        }
    }

    async fn act(self: &Arc<Self>, outcome: DispatchOutcome) -> EngineResult<Vec<WorkflowInstance>> {
        match outcome {
            DispatchOutcome::Created(instance) => {
                self.start_if_ready(&instance);
                Ok(vec![instance])
            }
            DispatchOutcome::CreatedMany { instances, complement } => {
                self.complements.lock().insert(complement.id(), complement);
                for instance in &instances {
                    self.start_if_ready(instance);
                }
                Ok(instances)
            }
            DispatchOutcome::Transitioned { instance, event } => {
                self.deliver(instance.id, event).await?;
                Ok(vec![self.load(instance.id)?])
            }
        }
    }

    // -----------------------------------------------------------------------
    // Sub-workflows
    // -----------------------------------------------------------------------

    fn start_child(
        self: &Arc<Self>,
        parent: &WorkflowInstance,
        task: &TaskInstance,
        definition_code: i64,
        pending: &mut VecDeque<InstanceEvent>,
    ) {
        let report = |state| InstanceEvent::TaskReport(TaskReport::new(task.id, task.attempt, state));

        let child = match self.dispatcher.create_child(parent, task, definition_code) {
            Ok(child) => child,
            Err(e) => {
                warn!(task_instance_id = task.id, error = %e, "Sub-workflow could not be created");
                let message = format!("cannot start sub-workflow {definition_code}: {e}");
                pending.push_back(report(ReportedState::Failure { message }));
                return;
            }
        };

        info!(task_instance_id = task.id, child_instance_id = child.id, "Sub-workflow instance created");
        pending.push_back(report(ReportedState::Running));
        match child.state {
            Wf::SubmittedSuccess => {
                self.children.lock().insert(task.id, child.id);
                self.post_or_log(child.id, InstanceEvent::Start);
            }
            Wf::WaitingThread => {
                self.children.lock().insert(task.id, child.id);
            }
            state => {
                let message = format!("sub-workflow instance {} ended in {state}", child.id);
                pending.push_back(report(ReportedState::Failure { message }));
            }
        }
    }

    fn kill_child(self: &Arc<Self>, task_instance_id: i64, pending: &mut VecDeque<InstanceEvent>) {
        let child = self.children.lock().get(&task_instance_id).copied();
        if let Some(child_id) = child {
            self.post_or_log(child_id, InstanceEvent::Kill);
            return;
        }
        // No child to cancel; acknowledge on its behalf.
        match task_repo::get_task_instance(&self.pool, task_instance_id) {
            Ok(task) => pending.push_back(InstanceEvent::TaskReport(TaskReport::new(
                task.id,
                task.attempt,
                ReportedState::Killed,
            ))),
            Err(e) => warn!(task_instance_id, error = %e, "Cannot acknowledge sub-workflow kill"),
        }
    }

    fn report_to_parent(self: &Arc<Self>, child: &WorkflowInstance, parent_id: i64, parent_task_id: i64, status: Wf) {
        // Only the child the parent is currently waiting on may answer.
        let current = {
            let mut children = self.children.lock();
            if children.get(&parent_task_id) == Some(&child.id) {
                children.remove(&parent_task_id);
                true
            } else {
                false
            }
        };
        if !current {
            debug!(child_instance_id = child.id, parent_task_id, "Parent no longer waits on this child");
            return;
        }

        let attempt = match task_repo::get_task_instance(&self.pool, parent_task_id) {
            Ok(task) => task.attempt,
            Err(e) => {
                warn!(parent_task_id, error = %e, "Parent task instance missing");
                return;
            }
        };
        let state = match status {
            Wf::Success => ReportedState::Success { branch: None },
            Wf::Stop | Wf::Kill => ReportedState::Killed,
            other => ReportedState::Failure {
                message: format!("sub-workflow instance {} ended in {other}", child.id),
            },
        };
        self.post_or_log(parent_id, InstanceEvent::TaskReport(TaskReport::new(parent_task_id, attempt, state)));
    }

    // -----------------------------------------------------------------------
    // Terminal instances
    // -----------------------------------------------------------------------

    fn on_finished(self: &Arc<Self>, instance: &WorkflowInstance, status: Wf) {
        if let Some(next) = self.dispatcher.serial().finish(instance.definition_code, instance.id) {
            info!(definition_code = instance.definition_code, next, "Starting next serial instance");
            self.post_or_log(next, InstanceEvent::Start);
        }
        if let (Some(complement_id), Some(date)) = (instance.complement_id, instance.schedule_time) {
            self.advance_complement(complement_id, date, status);
        }
        if let (Some(parent_id), Some(parent_task_id)) = (instance.parent_instance_id, instance.parent_task_instance_id) {
            self.report_to_parent(instance, parent_id, parent_task_id, status);
        }
    }

    fn advance_complement(self: &Arc<Self>, complement_id: Uuid, date: DateTime<Utc>, status: Wf) {
        let created = {
            let mut complements = self.complements.lock();
            let Some(run) = complements.get_mut(&complement_id) else {
                debug!(%complement_id, "Backfill no longer tracked");
                return;
            };

            let mut created = Vec::new();
            for next in run.on_finished(date, status) {
                match self.dispatcher.create_complement_instance(run, next) {
                    Ok(instance) => created.push(instance),
                    Err(e) => error!(%complement_id, date = %next, error = %e, "Backfill instance not created"),
                }
            }
            if run.is_complete() {
                info!(%complement_id, "Backfill complete");
                complements.remove(&complement_id);
            }
            created
        };

        for instance in &created {
            self.start_if_ready(instance);
        }
    }
}
