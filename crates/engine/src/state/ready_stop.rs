use std::sync::Arc;

use async_trait::async_trait;
use db::models::WorkflowExecutionStatus;

use super::common::{
    apply_task_state_change, assert_state, drain_in_flight, emit, emit_when_drained,
    undefined_event, workflow_finish, TaskChange,
};
use super::WorkflowStateAction;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::{TaskOperationKind, WorkflowStateEvent};
use crate::runnable::WorkflowExecutionRunnable;

/// Stop requested; in-flight tasks are being killed.
pub struct ReadyStopStateAction;

#[async_trait]
impl WorkflowStateAction for ReadyStopStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::ReadyStop
    }

    async fn handle(
        &self,
        ctx: &EngineContext,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        assert_state(runnable, self.state());
        match event {
            WorkflowStateEvent::Start | WorkflowStateEvent::TopologyTransition { .. } => {
                emit_when_drained(runnable, WorkflowStateEvent::Stopped)
            }
            // Also a `Stop` requeued after the transition here was persisted.
            WorkflowStateEvent::Stop => {
                drain_in_flight(ctx, runnable, TaskOperationKind::Kill, WorkflowStateEvent::Stopped)
                    .await
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
            WorkflowStateEvent::Pause
            | WorkflowStateEvent::Paused
            | WorkflowStateEvent::Finalize
            | WorkflowStateEvent::TriggerNextTask { .. } => {
                undefined_event(runnable, self.state(), &event)
            }
        }
    }
}
