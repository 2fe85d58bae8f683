//! `worker` crate: the contract between the engine and the worker pool.
//!
//! The engine hands task instances to a [`TaskExecutor`] and learns about
//! their progress through [`TaskReport`]s delivered on an inbound channel.
//! How a worker actually runs a shell script or a SQL statement is not this
//! crate's concern.

pub mod error;
pub mod traits;
pub mod mock;

pub use error::WorkerError;
pub use traits::{ReportedState, TaskDispatch, TaskExecutor, TaskReport};
