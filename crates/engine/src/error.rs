//! Engine-level error types.

use db::models::WorkflowExecutionStatus;
use thiserror::Error;

/// Structural problems found while building an execution graph.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Two or more tasks share the same code.
    #[error("duplicate task code: {0}")]
    DuplicateTaskCode(i64),

    /// An edge references a task code that doesn't exist in the definition.
    #[error("edge references unknown task {code} ({side} side)")]
    UnknownTaskReference { code: i64, side: &'static str },

    /// A requested start node is not part of the definition.
    #[error("start node {0} is not part of the workflow")]
    UnknownStartNode(i64),

    /// Topological sort detected a cycle.
    #[error("workflow graph contains a cycle")]
    CycleDetected,
}

/// Errors produced by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid workflow graph: {0}")]
    Graph(#[from] GraphError),

    /// No live runnable for this instance; it may already have finalized.
    #[error("workflow runnable {0} not found")]
    RunnableNotFound(i64),

    #[error("workflow instance {0} is already running on this master")]
    AlreadyRunning(i64),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("event repository of workflow instance {0} is closed")]
    RepositoryClosed(i64),

    /// The state-action table does not cover a declared state.
    #[error("no state action registered for {0}")]
    MissingStateAction(WorkflowExecutionStatus),

    #[error("more than one state action registered for {0}")]
    DuplicateStateAction(WorkflowExecutionStatus),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("registry error: {0}")]
    Registry(#[from] registry::RegistryError),

    #[error("executor error: {0}")]
    Executor(#[from] nodes::ExecutorError),
}

impl EngineError {
    /// Storage or registry outages that should be retried rather than dropped.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(err) => err.is_transient(),
            Self::Registry(err) => err.is_transient(),
            _ => false,
        }
    }
}
