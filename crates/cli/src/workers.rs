//! In-process stand-in for the worker fleet behind `dagflow serve`.
//!
//! Every dispatch is accepted on one host. With a run time configured the
//! workers also report back: a task succeeds once the run time (plus its
//! retry delay) has passed, and a kill or pause settles it right away.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use db::models::TaskExecutionStatus;
use engine::{TaskEventReport, WorkflowCoordinator};
use nodes::{ExecutorError, TaskDispatchRequest, TaskExecutorClient, TaskInstruction};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

pub struct SimulatedWorkers {
    host: String,
    instructions: Option<mpsc::UnboundedSender<TaskInstruction>>,
}

impl SimulatedWorkers {
    /// Workers that never report back. Results arrive through
    /// `POST /api/v1/task-events`.
    pub fn accepting(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            instructions: None,
        }
    }

    /// Workers whose instructions are played out by [`report_results`].
    pub fn reporting(host: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<TaskInstruction>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = Self {
            host: host.into(),
            instructions: Some(tx),
        };
        (workers, rx)
    }

    fn forward(&self, instruction: TaskInstruction) -> Result<(), ExecutorError> {
        match &self.instructions {
            Some(tx) => tx
                .send(instruction)
                .map_err(|_| ExecutorError::Retryable("simulated workers stopped".into())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TaskExecutorClient for SimulatedWorkers {
    async fn dispatch(&self, request: &TaskDispatchRequest) -> Result<String, ExecutorError> {
        self.forward(TaskInstruction::Dispatch(request.clone()))?;
        Ok(self.host.clone())
    }

    async fn kill(&self, host: &str, task_instance_id: i64) -> Result<(), ExecutorError> {
        self.forward(TaskInstruction::Kill {
            host: host.to_string(),
            task_instance_id,
        })
    }

    async fn pause(&self, host: &str, task_instance_id: i64) -> Result<(), ExecutorError> {
        self.forward(TaskInstruction::Pause {
            host: host.to_string(),
            task_instance_id,
        })
    }
}

/// Play out worker instructions against `coordinator` until the sending
/// side is dropped.
pub async fn report_results(
    coordinator: Arc<WorkflowCoordinator>,
    mut instructions: mpsc::UnboundedReceiver<TaskInstruction>,
    host: String,
    run_for: Duration,
) {
    let mut running: HashMap<i64, (i64, JoinHandle<()>)> = HashMap::new();
    while let Some(instruction) = instructions.recv().await {
        running.retain(|_, (_, handle)| !handle.is_finished());
        match instruction {
            TaskInstruction::Dispatch(request) => {
                let coordinator = Arc::clone(&coordinator);
                let host = host.clone();
                let delay = run_for + Duration::from_secs(request.delay_secs);
                let workflow_instance_id = request.workflow_instance_id;
                let task_instance_id = request.task_instance_id;
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    report(
                        &coordinator,
                        workflow_instance_id,
                        task_instance_id,
                        TaskExecutionStatus::Success,
                        host,
                    );
                });
                running.insert(task_instance_id, (workflow_instance_id, handle));
            }
            TaskInstruction::Kill {
                host,
                task_instance_id,
            } => settle(&coordinator, &mut running, task_instance_id, TaskExecutionStatus::Killed, host),
            TaskInstruction::Pause {
                host,
                task_instance_id,
            } => settle(&coordinator, &mut running, task_instance_id, TaskExecutionStatus::Paused, host),
        }
    }
    for (_, handle) in running.into_values() {
        handle.abort();
    }
    info!("simulated workers stopped");
}

fn settle(
    coordinator: &WorkflowCoordinator,
    running: &mut HashMap<i64, (i64, JoinHandle<()>)>,
    task_instance_id: i64,
    status: TaskExecutionStatus,
    host: String,
) {
    let Some((workflow_instance_id, handle)) = running.remove(&task_instance_id) else {
        debug!(task_instance_id, %status, "task already finished on the simulated worker");
        return;
    };
    handle.abort();
    report(coordinator, workflow_instance_id, task_instance_id, status, host);
}

fn report(
    coordinator: &WorkflowCoordinator,
    workflow_instance_id: i64,
    task_instance_id: i64,
    status: TaskExecutionStatus,
    host: String,
) {
    let result = coordinator.report_task_event(TaskEventReport {
        workflow_instance_id,
        task_instance_id,
        status,
        host: Some(host),
    });
    if let Err(err) = result {
        debug!(workflow_instance_id, task_instance_id, error = %err, "workflow gone, dropping task result");
    }
}
