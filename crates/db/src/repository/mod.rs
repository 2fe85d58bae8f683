//! Repository functions, one function per persistence operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! State-changing functions come in a compare-and-swap flavour so callers
//! can make transitions race-safe.

pub mod workflow_instances;
pub mod task_instances;
pub mod task_groups;
pub mod task_group_queue;
pub mod commands;
