//! Command dispatcher.
//!
//! Turns a [`Command`] into workflow instances, or into an event for an
//! existing instance.  Validation happens before anything is written: a
//! rejected command never leaves an instance behind.
//!
//! Commands reach the dispatcher either directly ([`CommandDispatcher::dispatch`])
//! or through the durable queue ([`CommandDispatcher::enqueue`] /
//! [`CommandDispatcher::consume_next`]), where each row is consumed exactly once.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use db::models::{CommandType, TaskDependType, TaskInstance, WorkflowExecutionStatus as Wf, WorkflowInstance};
use db::repository::{commands as command_repo, workflow_instances as instance_repo};
use db::{DbError, DbPool};

use crate::complement::ComplementRun;
use crate::config::EngineConfig;
use crate::dag::WorkflowGraph;
use crate::error::{EngineError, EngineResult, ValidationError};
use crate::models::{Command, CommandKind, ExecutionType, ReleaseState, WorkflowDefinition};
use crate::serial::{SerialAdmission, SerialGate};
use crate::workflow_instance::InstanceEvent;

// ---------------------------------------------------------------------------
// Definition catalog
// ---------------------------------------------------------------------------

/// Source of published workflow definitions.
pub trait DefinitionCatalog: Send + Sync {
    /// Latest published version of `code`.
    fn definition(&self, code: i64) -> Option<WorkflowDefinition>;

    /// One specific published version.  Instances always run the version
    /// they were created from.
    fn definition_version(&self, code: i64, version: i32) -> Option<WorkflowDefinition> {
        self.definition(code).filter(|d| d.version == version)
    }
}

/// Catalog kept in memory; validates graphs on publish and keeps every
/// published version.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    definitions: RwLock<HashMap<i64, BTreeMap<i32, WorkflowDefinition>>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a definition.  Re-publishing a code creates a new version.
    pub fn publish(&self, mut definition: WorkflowDefinition) -> Result<i32, ValidationError> {
        WorkflowGraph::build(definition.clone())?;

        let mut definitions = self.definitions.write();
        let versions = definitions.entry(definition.code).or_default();
        if let Some((&latest, _)) = versions.last_key_value() {
            definition.version = definition.version.max(latest + 1);
        }
        let version = definition.version;
        info!(definition_code = definition.code, version, "Published workflow definition '{}'", definition.name);
        versions.insert(version, definition);
        Ok(version)
    }

    /// Release state of the latest version; earlier versions keep running
    /// their existing instances.
    pub fn set_release_state(&self, code: i64, state: ReleaseState) -> Result<(), ValidationError> {
        let mut definitions = self.definitions.write();
        let definition = definitions
            .get_mut(&code)
            .and_then(|versions| versions.values_mut().next_back())
            .ok_or(ValidationError::DefinitionNotFound(code))?;
        definition.release_state = state;
        Ok(())
    }
}

impl DefinitionCatalog for InMemoryCatalog {
    fn definition(&self, code: i64) -> Option<WorkflowDefinition> {
        let definitions = self.definitions.read();
        definitions.get(&code)?.values().next_back().cloned()
    }

    fn definition_version(&self, code: i64, version: i32) -> Option<WorkflowDefinition> {
        self.definitions.read().get(&code)?.get(&version).cloned()
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// What a dispatched command produced.
#[derive(Debug)]
pub enum DispatchOutcome {
    Created(WorkflowInstance),
    /// A backfill: the first batch of instances plus the generator that
    /// yields the rest.
    CreatedMany {
        instances: Vec<WorkflowInstance>,
        complement: ComplementRun,
    },
    /// The command targets an existing instance.
    Transitioned {
        instance: WorkflowInstance,
        event: InstanceEvent,
    },
}

impl DispatchOutcome {
    pub fn instances(&self) -> Vec<&WorkflowInstance> {
        match self {
            Self::Created(instance) | Self::Transitioned { instance, .. } => vec![instance],
            Self::CreatedMany { instances, .. } => instances.iter().collect(),
        }
    }
}

pub struct CommandDispatcher {
    pool: DbPool,
    catalog: Arc<dyn DefinitionCatalog>,
    serial: SerialGate,
    default_parallelism: u32,
}

impl CommandDispatcher {
    pub fn new(pool: DbPool, catalog: Arc<dyn DefinitionCatalog>, config: &EngineConfig) -> Self {
        Self {
            pool,
            catalog,
            serial: SerialGate::new(),
            default_parallelism: config.default_complement_parallelism,
        }
    }

    pub fn serial(&self) -> &SerialGate {
        &self.serial
    }

    /// Rebuild serial lanes from the unfinished instances in the store.
    ///
    /// Returns waiting instances that now hold a lane and must be started.
    pub fn recover_serial_lanes(&self) -> Vec<i64> {
        let mut by_definition: BTreeMap<i64, Vec<WorkflowInstance>> = BTreeMap::new();
        for instance in instance_repo::list_unfinished(&self.pool) {
            by_definition.entry(instance.definition_code).or_default().push(instance);
        }

        let mut handed_over = Vec::new();
        for (code, instances) in by_definition {
            let serial = self
                .catalog
                .definition_version(code, instances[0].definition_version)
                .or_else(|| self.catalog.definition(code))
                .is_some_and(|d| d.execution_type.is_serial());
            if !serial {
                continue;
            }

            let (waiting, holders): (Vec<_>, Vec<_>) =
                instances.iter().partition(|i| i.state == Wf::WaitingThread);
            if holders.len() > 1 {
                warn!(definition_code = code, holders = holders.len(), "Several serial instances active; oldest keeps the lane");
            }
            let holder = holders.first().map(|i| i.id);
            let waiting: Vec<i64> = waiting.iter().map(|i| i.id).collect();
            debug!(definition_code = code, ?holder, waiting = waiting.len(), "Serial lane restored");

            if let Some(next) = self.serial.restore_lane(code, holder, waiting) {
                info!(definition_code = code, next, "Serial lane had no holder; handing over");
                handed_over.push(next);
            }
        }
        handed_over
    }

    /// The validated graph of one published version of a definition.
    pub fn graph(&self, definition_code: i64, version: i32) -> EngineResult<Arc<WorkflowGraph>> {
        let definition = self
            .catalog
            .definition_version(definition_code, version)
            .ok_or(ValidationError::DefinitionVersionNotFound(definition_code, version))?;
        Ok(Arc::new(WorkflowGraph::build(definition)?))
    }

    /// Put a command on the durable queue.
    pub fn enqueue(&self, command: &Command) -> EngineResult<Uuid> {
        let payload = serde_json::to_value(command)?;
        command_repo::enqueue_command(&self.pool, command.id, command.command_type(), payload)?;
        debug!(command_id = %command.id, command_type = %command.command_type(), "Command enqueued");
        Ok(command.id)
    }

    /// Take the oldest pending command off the queue and dispatch it.
    ///
    /// Returns `None` when the queue is empty.  The row is marked processed
    /// or failed either way, so it is never seen twice.
    pub fn consume_next(&self) -> Option<EngineResult<DispatchOutcome>> {
        let row = command_repo::fetch_next_command(&self.pool)?;

        let result = serde_json::from_value::<Command>(row.payload.clone())
            .map_err(EngineError::from)
            .and_then(|command| self.dispatch(&command));

        let recorded = match &result {
            Ok(_) => command_repo::complete_command(&self.pool, row.id),
            Err(e) => {
                warn!(command_id = %row.id, error = %e, "Command rejected");
                command_repo::fail_command(&self.pool, row.id, &e.to_string())
            }
        };
        if let Err(e) = recorded {
            error!(command_id = %row.id, error = %e, "Could not record command outcome");
        }
        Some(result)
    }

    /// Dispatch one command.
    ///
    /// # Errors
    /// - [`EngineError::Validation`] for a missing tenant, an unknown or
    ///   offline definition, a cyclic graph, unknown start nodes or an empty
    ///   backfill range.  No instance is created.
    /// - [`EngineError::InstanceNotFound`] / [`EngineError::InvalidTransition`]
    ///   for commands that target an instance.
    #[instrument(skip_all, fields(command_id = %command.id, command_type = %command.command_type()))]
    pub fn dispatch(&self, command: &Command) -> EngineResult<DispatchOutcome> {
        match &command.kind {
            CommandKind::StartProcess | CommandKind::Scheduler => {
                let (definition, tenant) = self.validate(
                    command.definition_code,
                    command.tenant.as_deref(),
                    &command.start_nodes,
                    command.task_depend_type,
                )?;
                let row = new_instance_row(command, &definition, tenant, None);
                Ok(DispatchOutcome::Created(self.create_instance(row, definition.execution_type)?))
            }
            CommandKind::ComplementData(params) => {
                self.validate(
                    command.definition_code,
                    command.tenant.as_deref(),
                    &command.start_nodes,
                    command.task_depend_type,
                )?;
                let mut complement = ComplementRun::new(command, params, self.default_parallelism)?;
                let instances = complement
                    .start()
                    .into_iter()
                    .map(|date| self.create_complement_instance(&complement, date))
                    .collect::<EngineResult<Vec<_>>>()?;
                Ok(DispatchOutcome::CreatedMany { instances, complement })
            }
            CommandKind::RepeatRunning { instance_id } => {
                let previous = self.instance(*instance_id)?;
                if !previous.state.is_terminal() {
                    return Err(EngineError::invalid("workflow instance", previous.id, previous.state, "repeat running"));
                }
                let (definition, _) = self.validate(
                    previous.definition_code,
                    Some(&previous.tenant),
                    &previous.start_nodes,
                    previous.task_depend_type,
                )?;
                let row = rerun_row(&previous, &definition);
                Ok(DispatchOutcome::Created(self.create_instance(row, definition.execution_type)?))
            }
            CommandKind::RecoverSuspendedProcess { instance_id } => self.transition(
                *instance_id,
                |s| matches!(s, Wf::Pause | Wf::ReadyPause),
                InstanceEvent::Resume,
                "recover suspended",
            ),
            CommandKind::RecoverToleranceFaultProcess { instance_id } => self.transition(
                *instance_id,
                |s| matches!(s, Wf::RunningExecution | Wf::ReadyPause),
                InstanceEvent::RecoverFaultTolerance,
                "recover tolerance fault",
            ),
            CommandKind::Pause { instance_id } => {
                self.transition(*instance_id, |s| s == Wf::RunningExecution, InstanceEvent::Pause, "pause")
            }
            CommandKind::Stop { instance_id } => {
                self.transition(*instance_id, |s| !s.is_terminal(), InstanceEvent::Stop, "stop")
            }
            CommandKind::RecoverFromWaiting { instance_id } => {
                let instance = self.instance(*instance_id)?;
                if instance.state != Wf::WaitingThread || !self.serial.try_claim(instance.definition_code, instance.id) {
                    return Err(EngineError::invalid("workflow instance", instance.id, instance.state, "recover from waiting"));
                }
                Ok(DispatchOutcome::Transitioned { instance, event: InstanceEvent::Start })
            }
        }
    }

    /// Create the instance for one backfill date.
    pub fn create_complement_instance(&self, run: &ComplementRun, date: DateTime<Utc>) -> EngineResult<WorkflowInstance> {
        let command = run.command();
        let (definition, tenant) = self.validate(
            command.definition_code,
            command.tenant.as_deref(),
            &command.start_nodes,
            command.task_depend_type,
        )?;
        let mut row = new_instance_row(command, &definition, tenant, Some(date));
        row.complement_id = Some(run.id());
        self.create_instance(row, definition.execution_type)
    }

    /// Create the child instance a sub-workflow task runs.
    pub fn create_child(
        &self,
        parent: &WorkflowInstance,
        task: &TaskInstance,
        definition_code: i64,
    ) -> EngineResult<WorkflowInstance> {
        let (definition, tenant) = self.validate(definition_code, Some(&parent.tenant), &[], TaskDependType::TaskPost)?;
        let command = Command {
            failure_strategy: parent.failure_strategy,
            warning_type: parent.warning_type,
            warning_group_id: parent.warning_group_id,
            priority: parent.priority,
            worker_group: parent.worker_group.clone(),
            environment_code: parent.environment_code,
            start_params: parent.start_params.clone(),
            dry_run: parent.dry_run,
            test_flag: parent.test_flag,
            ..Command::start(definition_code)
        };
        let mut row = new_instance_row(&command, &definition, tenant, parent.schedule_time);
        row.parent_instance_id = Some(parent.id);
        row.parent_task_instance_id = Some(task.id);
        self.create_instance(row, definition.execution_type)
    }

    fn validate(
        &self,
        definition_code: i64,
        tenant: Option<&str>,
        start_nodes: &[i64],
        depend: TaskDependType,
    ) -> EngineResult<(WorkflowDefinition, String)> {
        let definition = self
            .catalog
            .definition(definition_code)
            .ok_or(ValidationError::DefinitionNotFound(definition_code))?;
        if definition.release_state == ReleaseState::Offline {
            return Err(ValidationError::DefinitionOffline(definition_code).into());
        }

        let tenant = tenant
            .map(str::to_owned)
            .or_else(|| definition.tenant.clone())
            .filter(|t| !t.trim().is_empty())
            .ok_or(ValidationError::MissingTenant)?;

        let graph = WorkflowGraph::build(definition)?;
        graph.scope(start_nodes, depend)?;
        Ok((graph.definition().clone(), tenant))
    }

    fn create_instance(&self, row: WorkflowInstance, execution_type: ExecutionType) -> EngineResult<WorkflowInstance> {
        let mut instance = instance_repo::insert_instance(&self.pool, row)?;

        if execution_type.is_serial() {
            let discard = execution_type == ExecutionType::SerialDiscard;
            match self.serial.admit(instance.definition_code, instance.id, discard) {
                SerialAdmission::Run => {}
                SerialAdmission::Wait => {
                    instance = instance_repo::compare_and_set_state(
                        &self.pool,
                        instance.id,
                        Wf::SubmittedSuccess,
                        Wf::WaitingThread,
                    )?;
                    info!(workflow_instance_id = instance.id, "Serial definition busy; instance waiting");
                }
                SerialAdmission::Discard => {
                    instance = instance_repo::compare_and_set_state(&self.pool, instance.id, Wf::SubmittedSuccess, Wf::Stop)?;
                    instance.end_time = Some(Utc::now());
                    instance_repo::update_instance(&self.pool, &instance)?;
                    warn!(workflow_instance_id = instance.id, "Serial definition busy; instance discarded");
                }
            }
        }

        info!(
            workflow_instance_id = instance.id,
            definition_code = instance.definition_code,
            state = %instance.state,
            "Workflow instance created"
        );
        Ok(instance)
    }

    fn transition(
        &self,
        instance_id: i64,
        accepts: impl Fn(Wf) -> bool,
        event: InstanceEvent,
        action: &'static str,
    ) -> EngineResult<DispatchOutcome> {
        let instance = self.instance(instance_id)?;
        if !accepts(instance.state) {
            return Err(EngineError::invalid("workflow instance", instance.id, instance.state, action));
        }
        Ok(DispatchOutcome::Transitioned { instance, event })
    }

    fn instance(&self, instance_id: i64) -> EngineResult<WorkflowInstance> {
        instance_repo::get_instance(&self.pool, instance_id).map_err(|e| match e {
            DbError::NotFound { .. } => EngineError::InstanceNotFound(instance_id),
            other => other.into(),
        })
    }
}

/// A fresh, not yet persisted instance row for `command`.
pub(crate) fn new_instance_row(
    command: &Command,
    definition: &WorkflowDefinition,
    tenant: String,
    schedule_time: Option<DateTime<Utc>>,
) -> WorkflowInstance {
    let now = Utc::now();
    WorkflowInstance {
        id: 0,
        definition_code: definition.code,
        definition_version: definition.version,
        name: format!("{}-{}", definition.name, now.format("%Y%m%d%H%M%S%3f")),
        state: Wf::SubmittedSuccess,
        command_type: command.command_type(),
        schedule_time: schedule_time.or(command.schedule_time),
        submit_time: now,
        start_time: None,
        end_time: None,
        failure_strategy: command.failure_strategy,
        warning_type: command.warning_type,
        warning_group_id: command.warning_group_id,
        priority: command.priority,
        worker_group: command.worker_group.clone(),
        tenant,
        environment_code: command.environment_code,
        timeout_minutes: command.timeout_minutes.or(definition.timeout_minutes),
        start_params: command.start_params.clone(),
        start_nodes: command.start_nodes.clone(),
        task_depend_type: command.task_depend_type,
        parent_instance_id: None,
        parent_task_instance_id: None,
        complement_id: None,
        dry_run: command.dry_run,
        test_flag: command.test_flag,
        first_failed_task: None,
        run_times: 1,
        forced_success: false,
        host: None,
    }
}

fn rerun_row(previous: &WorkflowInstance, definition: &WorkflowDefinition) -> WorkflowInstance {
    WorkflowInstance {
        id: 0,
        definition_version: definition.version,
        state: Wf::SubmittedSuccess,
        command_type: CommandType::RepeatRunning,
        submit_time: Utc::now(),
        start_time: None,
        end_time: None,
        complement_id: None,
        first_failed_task: None,
        run_times: previous.run_times + 1,
        forced_success: false,
        host: None,
        ..previous.clone()
    }
}
