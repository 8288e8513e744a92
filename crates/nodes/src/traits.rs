//! The `TaskExecutorClient` trait: how a master talks to workers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ExecutorError;

/// Everything a worker needs to run one task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDispatchRequest {
    pub workflow_instance_id: i64,
    pub task_instance_id: i64,
    pub task_code: i64,
    pub name: String,
    /// Plugin type; the worker picks the implementation.
    pub task_type: String,
    /// Parameter bag handed to the plugin untouched.
    pub params: Value,
    pub retry_times: u32,
    /// Seconds the worker should wait before starting (retry back-off).
    pub delay_secs: u64,
}

/// An instruction as seen by a worker, keyed by task-instance id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskInstruction {
    Dispatch(TaskDispatchRequest),
    Kill { host: String, task_instance_id: i64 },
    Pause { host: String, task_instance_id: i64 },
}

impl TaskInstruction {
    pub fn task_instance_id(&self) -> i64 {
        match self {
            Self::Dispatch(request) => request.task_instance_id,
            Self::Kill { task_instance_id, .. } | Self::Pause { task_instance_id, .. } => {
                *task_instance_id
            }
        }
    }
}

#[async_trait]
pub trait TaskExecutorClient: Send + Sync {
    /// Hand a task to some worker and return the host that accepted it.
    async fn dispatch(&self, request: &TaskDispatchRequest) -> Result<String, ExecutorError>;

    /// Kill a task on the given worker. Killing a finished task is a no-op.
    async fn kill(&self, host: &str, task_instance_id: i64) -> Result<(), ExecutorError>;

    /// Ask a worker to pause a task once its current step completes.
    async fn pause(&self, host: &str, task_instance_id: i64) -> Result<(), ExecutorError>;
}
