//! `db` crate: pure persistence layer.
//!
//! Provides the shared in-memory store, typed row structs, and repository
//! functions for every table the engine touches.  State updates go through
//! compare-and-swap helpers so concurrent transitions cannot clobber each
//! other.  No business logic lives here.

pub mod error;
pub mod pool;
pub mod repository;
pub mod models;

pub use pool::{create_pool, DbPool, Store};
pub use error::DbError;
