use std::sync::Arc;

use async_trait::async_trait;
use db::models::WorkflowExecutionStatus;

use super::common::{
    apply_task_state_change, assert_state, drain_in_flight, emit, emit_when_drained, transition,
    trigger_tasks, undefined_event, workflow_finish, TaskChange,
};
use super::WorkflowStateAction;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::{TaskOperationKind, WorkflowStateEvent};
use crate::runnable::WorkflowExecutionRunnable;

/// Pause requested; waits for in-flight tasks to drain. No new tasks are
/// triggered, but the workflow may still finish on its own first.
pub struct ReadyPauseStateAction;

#[async_trait]
impl WorkflowStateAction for ReadyPauseStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::ReadyPause
    }

    async fn handle(
        &self,
        ctx: &EngineContext,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        assert_state(runnable, self.state());
        match event {
            WorkflowStateEvent::Start => {
                let start_nodes = runnable.graph().start_nodes();
                trigger_tasks(ctx, runnable, start_nodes).await
            }
            WorkflowStateEvent::Paused => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Paused).await
            }
            WorkflowStateEvent::Succeed => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Success).await
            }
            WorkflowStateEvent::Failed => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Failed).await
            }
            WorkflowStateEvent::Stopped => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Stopped).await
            }
            WorkflowStateEvent::Stop => {
                transition(ctx, runnable, WorkflowExecutionStatus::ReadyStop).await?;
                drain_in_flight(ctx, runnable, TaskOperationKind::Kill, WorkflowStateEvent::Stopped)
                    .await
            }
            // Also a `Pause` requeued after the transition here was persisted.
            WorkflowStateEvent::Pause => {
                drain_in_flight(ctx, runnable, TaskOperationKind::Pause, WorkflowStateEvent::Paused)
                    .await
            }
            WorkflowStateEvent::TopologyTransition { .. } => {
                emit_when_drained(runnable, WorkflowStateEvent::Paused)
            }
            WorkflowStateEvent::TaskStateChange {
                task_instance_id,
                status,
                host,
            } => {
                let change =
                    apply_task_state_change(ctx, runnable, task_instance_id, status, host, false)
                        .await?;
                match change {
                    TaskChange::Finished(task_code) => {
                        emit(runnable, WorkflowStateEvent::TopologyTransition { task_code })
                    }
                    TaskChange::Ignored | TaskChange::Progressed | TaskChange::Retrying => Ok(()),
                }
            }
            WorkflowStateEvent::Finalize | WorkflowStateEvent::TriggerNextTask { .. } => {
                undefined_event(runnable, self.state(), &event)
            }
        }
    }
}
