//! `engine` crate: workflow graphs, admission control, the task and
//! workflow instance state machines, command dispatch and backfills.

pub mod config;
pub mod error;
pub mod models;
pub mod dag;
pub mod events;
pub mod task_group;
pub mod task_instance;
pub mod serial;
pub mod complement;
pub mod workflow_instance;
pub mod dispatcher;
pub mod runtime;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ValidationError};
pub use models::{Command, CommandKind, WorkflowDefinition};
pub use dag::WorkflowGraph;
pub use events::{EngineEvent, EventBus};
pub use task_group::{Admission, AdmissionControllerRegistry};
pub use complement::{expand_dates, ComplementRun};
pub use workflow_instance::{Effect, InstanceEvent, WorkflowInstanceMachine};
pub use dispatcher::{CommandDispatcher, DefinitionCatalog, DispatchOutcome, InMemoryCatalog};
pub use runtime::Runtime;

#[cfg(test)]
mod runtime_tests;
