//! `db` crate: pure persistence layer.
//!
//! Provides typed row structs, the [`WorkflowStore`] contract the scheduler
//! core persists through, and an in-memory implementation of it.
//! No scheduling logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use store::WorkflowStore;
