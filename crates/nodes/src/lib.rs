//! `nodes` crate: the boundary between masters and the workers that run tasks.
//!
//! Masters never execute task plugins themselves. They send a dispatch, kill
//! or pause instruction keyed by task-instance id through
//! [`TaskExecutorClient`]; workers report completion back as task events.

pub mod error;
pub mod traits;
pub mod mock;

pub use error::ExecutorError;
pub use traits::{TaskDispatchRequest, TaskExecutorClient, TaskInstruction};
