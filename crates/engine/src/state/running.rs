use std::sync::Arc;

use async_trait::async_trait;
use db::models::WorkflowExecutionStatus;

use super::common::{
    apply_task_state_change, assert_state, drain_in_flight, emit, on_task_finish, transition,
    trigger_tasks, undefined_event, workflow_finish, TaskChange,
};
use super::WorkflowStateAction;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::{TaskOperationKind, WorkflowStateEvent};
use crate::runnable::WorkflowExecutionRunnable;

/// Tasks are being triggered and run.
pub struct RunningStateAction;

#[async_trait]
impl WorkflowStateAction for RunningStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::Running
    }

    async fn handle(
        &self,
        ctx: &EngineContext,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        assert_state(runnable, self.state());
        match event {
            WorkflowStateEvent::Pause => {
                transition(ctx, runnable, WorkflowExecutionStatus::ReadyPause).await?;
                drain_in_flight(ctx, runnable, TaskOperationKind::Pause, WorkflowStateEvent::Paused)
                    .await
            }
            WorkflowStateEvent::Stop => {
                transition(ctx, runnable, WorkflowExecutionStatus::ReadyStop).await?;
                drain_in_flight(ctx, runnable, TaskOperationKind::Kill, WorkflowStateEvent::Stopped)
                    .await
            }
            WorkflowStateEvent::Paused => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Paused).await
            }
            WorkflowStateEvent::Stopped => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Stopped).await
            }
            WorkflowStateEvent::Succeed => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Success).await
            }
            WorkflowStateEvent::Failed => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Failed).await
            }
            WorkflowStateEvent::TopologyTransition { task_code } => {
                on_task_finish(ctx, runnable, task_code).await
            }
            WorkflowStateEvent::TriggerNextTask { parent_task_code } => {
                let candidates: Vec<i64> = {
                    let graph = runnable.graph();
                    match parent_task_code {
                        Some(parent) => graph.successors(parent).into_iter().collect(),
                        None => graph.pending_nodes(),
                    }
                };
                trigger_tasks(ctx, runnable, candidates).await
            }
            WorkflowStateEvent::TaskStateChange {
                task_instance_id,
                status,
                host,
            } => {
                let change =
                    apply_task_state_change(ctx, runnable, task_instance_id, status, host, true)
                        .await?;
                match change {
                    TaskChange::Finished(task_code) => {
                        emit(runnable, WorkflowStateEvent::TopologyTransition { task_code })
                    }
                    TaskChange::Ignored | TaskChange::Progressed | TaskChange::Retrying => Ok(()),
                }
            }
            WorkflowStateEvent::Start | WorkflowStateEvent::Finalize => {
                undefined_event(runnable, self.state(), &event)
            }
        }
    }
}
