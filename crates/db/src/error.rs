//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// A compare-and-swap update found a different current value.
    #[error("{entity} {id}: expected state {expected}, found {actual}")]
    StaleState {
        entity: &'static str,
        id: String,
        expected: String,
        actual: String,
    },

    #[error("name already taken: '{0}'")]
    DuplicateName(String),
}

impl DbError {
    pub(crate) fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }
}
