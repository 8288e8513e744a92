//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DbError {
    /// The requested row does not exist.
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The store could not be reached. Callers may retry later.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The write was rejected (duplicate key, stale row, ...).
    #[error("write conflict: {0}")]
    Conflict(String),
}

impl DbError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// True for connectivity failures that are expected to heal on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
