//! `dagflow` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a workflow definition file and print its order.
//! - `plan-backfill`: list the dates a backfill would cover.
//! - `run`: run a definition to completion against an in-process
//!   worker that simulates every task.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::models::WorkflowExecutionStatus;
use engine::models::{ExecutionOrder, ScheduleSpec};
use engine::{expand_dates, EngineConfig, InMemoryCatalog, Runtime, WorkflowDefinition, WorkflowGraph};
use worker::{ReportedState, TaskDispatch, TaskExecutor, TaskReport, WorkerError};

#[derive(Parser)]
#[command(name = "dagflow", about = "Workflow orchestration core", version)]
struct Cli {
    /// Engine configuration file (JSON).  Defaults apply when omitted.
    #[arg(long, global = true, env = "DAGFLOW_CONFIG")]
    config: Option<PathBuf>,

    /// Log at debug level unless DAGFLOW_LOG says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the definition JSON file.
        path: PathBuf,
    },
    /// List the schedule dates a backfill over a range would create.
    PlanBackfill {
        /// First date, RFC 3339.
        #[arg(long)]
        start: DateTime<Utc>,
        /// Last date (inclusive), RFC 3339.
        #[arg(long)]
        end: DateTime<Utc>,
        #[arg(long, default_value_t = 86_400)]
        interval_secs: i64,
        /// Newest date first.
        #[arg(long)]
        desc: bool,
    },
    /// Run a definition end-to-end with a simulated worker.
    Run {
        /// Definition to run.
        path: PathBuf,
        /// Extra definitions its sub-workflow tasks refer to.
        #[arg(long = "with")]
        with: Vec<PathBuf>,
        /// Simulated task duration in milliseconds.
        #[arg(long, default_value_t = 50)]
        task_millis: u64,
        /// Task codes the simulated worker fails.
        #[arg(long, value_delimiter = ',')]
        fail: Vec<i64>,
        /// Give up after this many seconds.
        #[arg(long, default_value_t = 60)]
        timeout_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Validate { path } => validate(&path),
        Command::PlanBackfill { start, end, interval_secs, desc } => {
            let order = if desc { ExecutionOrder::Desc } else { ExecutionOrder::Asc };
            let dates = expand_dates(&ScheduleSpec::Range { start, end, interval_secs }, order)?;
            for date in &dates {
                println!("{}", date.to_rfc3339());
            }
            info!("{} dates planned", dates.len());
            Ok(())
        }
        Command::Run { path, with, task_millis, fail, timeout_secs } => {
            let worker = SimulatedWorker::new(Duration::from_millis(task_millis), fail);
            run(&path, &with, config, worker, Duration::from_secs(timeout_secs)).await
        }
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_env("DAGFLOW_LOG").unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    EngineConfig::from_json(&text).with_context(|| format!("invalid engine config in {}", path.display()))
}

fn load_definition(path: &Path) -> Result<WorkflowDefinition> {
    let text = std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid definition JSON in {}", path.display()))
}

fn validate(path: &Path) -> Result<()> {
    let graph = WorkflowGraph::build(load_definition(path)?)
        .with_context(|| format!("{} is not a valid workflow", path.display()))?;
    let order: Vec<i64> = graph.topological_order().iter().map(|&node| graph.task(node).code).collect();
    println!("Workflow '{}' is valid. Execution order: {order:?}", graph.definition().name);
    Ok(())
}

async fn run(path: &Path, with: &[PathBuf], config: EngineConfig, worker: SimulatedWorker, timeout: Duration) -> Result<()> {
    let catalog = Arc::new(InMemoryCatalog::new());
    for extra in with {
        catalog.publish(load_definition(extra)?)?;
    }
    let definition = load_definition(path)?;
    let code = definition.code;
    catalog.publish(definition)?;

    let (reports, inbox) = mpsc::channel(256);
    let worker = Arc::new(worker.reporting_to(reports));
    let runtime = Runtime::new(db::create_pool(), catalog, worker, config);
    runtime.spawn_report_listener(inbox);
    let resumed = runtime.recover_serial_lanes();
    if resumed > 0 {
        info!(resumed, "Resumed waiting serial instances");
    }
    let ticker = runtime.spawn_ticker();

    let instances = runtime.submit(engine::Command::start(code)).await?;
    let instance = instances.first().context("the start command created no instance")?;
    info!(workflow_instance_id = instance.id, "Workflow instance submitted");

    let finished = runtime.await_state(instance.id, WorkflowExecutionStatus::is_terminal, timeout).await?;
    ticker.abort();

    for task in runtime.task_instances(finished.id) {
        println!("  {:<24} {:<16} attempt {}", task.name, task.state, task.attempt);
    }
    println!("Workflow instance {} finished: {}", finished.id, finished.state);
    if finished.state != WorkflowExecutionStatus::Success {
        bail!("workflow instance {} ended in {}", finished.id, finished.state);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Simulated worker
// ---------------------------------------------------------------------------

/// Reports RUNNING, sleeps, then reports SUCCESS (or FAILURE for the task
/// codes it was told to fail).
struct SimulatedWorker {
    delay: Duration,
    failing: Vec<i64>,
    reports: Option<mpsc::Sender<TaskReport>>,
    attempts: Mutex<HashMap<i64, u32>>,
}

impl SimulatedWorker {
    fn new(delay: Duration, failing: Vec<i64>) -> Self {
        Self { delay, failing, reports: None, attempts: Mutex::new(HashMap::new()) }
    }

    fn reporting_to(self, reports: mpsc::Sender<TaskReport>) -> Self {
        Self { reports: Some(reports), ..self }
    }

    fn channel(&self) -> Result<mpsc::Sender<TaskReport>, WorkerError> {
        self.reports.clone().ok_or_else(|| WorkerError::Unavailable("no report channel".into()))
    }
}

#[async_trait]
impl TaskExecutor for SimulatedWorker {
    async fn submit(&self, dispatch: TaskDispatch) -> Result<(), WorkerError> {
        let reports = self.channel()?;
        self.attempts.lock().insert(dispatch.task_instance_id, dispatch.attempt);
        let delay = self.delay;
        let fails = self.failing.contains(&dispatch.task_code);

        tokio::spawn(async move {
            let (id, attempt) = (dispatch.task_instance_id, dispatch.attempt);
            let running = TaskReport::new(id, attempt, ReportedState::Running).with_host("local");
            if reports.send(running).await.is_err() {
                return;
            }
            tokio::time::sleep(delay).await;
            let state = if fails {
                ReportedState::Failure { message: "simulated failure".into() }
            } else {
                ReportedState::Success { branch: None }
            };
            if reports.send(TaskReport::new(id, attempt, state)).await.is_err() {
                warn!(task_instance_id = id, "Report channel closed before the task finished");
            }
        });
        Ok(())
    }

    async fn kill(&self, task_instance_id: i64) -> Result<(), WorkerError> {
        let reports = self.channel()?;
        let attempt = self.attempts.lock().get(&task_instance_id).copied().unwrap_or(1);
        reports
            .send(TaskReport::new(task_instance_id, attempt, ReportedState::Killed))
            .await
            .map_err(|_| WorkerError::Unavailable("report channel closed".into()))
    }
}
