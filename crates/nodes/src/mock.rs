//! `MockTaskExecutor`: a test double for `TaskExecutorClient`.
//!
//! Records every instruction it receives and answers dispatches with a
//! programmer-specified result. Nothing is actually run; tests report task
//! completion back into the engine themselves.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::{ExecutorError, TaskDispatchRequest, TaskExecutorClient, TaskInstruction};

/// Behaviour injected into `MockTaskExecutor` at construction time.
pub enum MockBehaviour {
    /// Accept every dispatch on the given worker host.
    Accept(String),
    /// Fail every dispatch with a `Retryable` error.
    FailRetryable(String),
    /// Fail every dispatch with a `Fatal` error.
    FailFatal(String),
}

pub struct MockTaskExecutor {
    behaviour: Mutex<MockBehaviour>,
    /// All instructions seen (in call order).
    pub calls: Arc<Mutex<Vec<TaskInstruction>>>,
}

impl MockTaskExecutor {
    /// Create a mock whose dispatches all land on `host`.
    pub fn accepting(host: impl Into<String>) -> Self {
        Self::with_behaviour(MockBehaviour::Accept(host.into()))
    }

    pub fn failing_retryable(msg: impl Into<String>) -> Self {
        Self::with_behaviour(MockBehaviour::FailRetryable(msg.into()))
    }

    pub fn failing_fatal(msg: impl Into<String>) -> Self {
        Self::with_behaviour(MockBehaviour::FailFatal(msg.into()))
    }

    pub fn with_behaviour(behaviour: MockBehaviour) -> Self {
        Self {
            behaviour: Mutex::new(behaviour),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_behaviour(&self, behaviour: MockBehaviour) {
        *self.behaviour.lock() = behaviour;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Task codes dispatched so far, in call order.
    pub fn dispatched_codes(&self) -> Vec<i64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TaskInstruction::Dispatch(request) => Some(request.task_code),
                _ => None,
            })
            .collect()
    }

    /// Dispatch requests received so far.
    pub fn dispatched(&self) -> Vec<TaskDispatchRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TaskInstruction::Dispatch(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Task-instance ids that received a kill instruction.
    pub fn killed(&self) -> Vec<i64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TaskInstruction::Kill { task_instance_id, .. } => Some(*task_instance_id),
                _ => None,
            })
            .collect()
    }

    /// Task-instance ids that received a pause instruction.
    pub fn paused(&self) -> Vec<i64> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                TaskInstruction::Pause { task_instance_id, .. } => Some(*task_instance_id),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl TaskExecutorClient for MockTaskExecutor {
    async fn dispatch(&self, request: &TaskDispatchRequest) -> Result<String, ExecutorError> {
        self.calls
            .lock()
            .push(TaskInstruction::Dispatch(request.clone()));
        debug!(task_instance_id = request.task_instance_id, "mock dispatch");

        match &*self.behaviour.lock() {
            MockBehaviour::Accept(host) => Ok(host.clone()),
            MockBehaviour::FailRetryable(msg) => Err(ExecutorError::Retryable(msg.clone())),
            MockBehaviour::FailFatal(msg) => Err(ExecutorError::Fatal(msg.clone())),
        }
    }

    async fn kill(&self, host: &str, task_instance_id: i64) -> Result<(), ExecutorError> {
        self.calls.lock().push(TaskInstruction::Kill {
            host: host.to_string(),
            task_instance_id,
        });
        Ok(())
    }

    async fn pause(&self, host: &str, task_instance_id: i64) -> Result<(), ExecutorError> {
        self.calls.lock().push(TaskInstruction::Pause {
            host: host.to_string(),
            task_instance_id,
        });
        Ok(())
    }
}
