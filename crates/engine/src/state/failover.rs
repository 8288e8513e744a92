use std::sync::Arc;

use async_trait::async_trait;
use db::models::WorkflowExecutionStatus;
use tracing::info;

use super::common::{
    apply_task_state_change, assert_state, drain_in_flight, emit, emit_trigger_pending,
    redispatch_undispatched, transition, undefined_event, TaskChange,
};
use super::WorkflowStateAction;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::{TaskOperationKind, WorkflowStateEvent};
use crate::runnable::WorkflowExecutionRunnable;

/// Re-adopted from a dead master; the graph was rebuilt from persisted
/// task attempts.
pub struct FailoverStateAction;

#[async_trait]
impl WorkflowStateAction for FailoverStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::Failover
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
                transition(ctx, runnable, WorkflowExecutionStatus::Running).await?;
                let reset = runnable.graph().reset_fault_tolerant();
                info!(workflow_instance_id = runnable.id(), ?reset, "resuming failed-over workflow");
                redispatch_undispatched(runnable)?;
                emit_trigger_pending(runnable)
            }
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
            WorkflowStateEvent::Paused
            | WorkflowStateEvent::Stopped
            | WorkflowStateEvent::Succeed
            | WorkflowStateEvent::Failed
            | WorkflowStateEvent::Finalize
            | WorkflowStateEvent::TopologyTransition { .. }
            | WorkflowStateEvent::TriggerNextTask { .. } => {
                undefined_event(runnable, self.state(), &event)
            }
        }
    }
}
