use std::sync::Arc;

use async_trait::async_trait;
use db::models::WorkflowExecutionStatus;
use tracing::info;

use super::common::{
    apply_task_state_change, assert_state, emit_trigger_pending, finalize, transition,
    undefined_event, workflow_finish,
};
use super::WorkflowStateAction;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::WorkflowStateEvent;
use crate::runnable::WorkflowExecutionRunnable;

pub struct PausedStateAction;

#[async_trait]
impl WorkflowStateAction for PausedStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::Paused
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
                let reset = runnable.graph().reset_for_rerun();
                info!(workflow_instance_id = runnable.id(), ?reset, "resuming paused workflow");
                emit_trigger_pending(runnable)
            }
            WorkflowStateEvent::Stop => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Stopped).await
            }
            WorkflowStateEvent::Finalize => {
                finalize(ctx, runnable);
                Ok(())
            }
            WorkflowStateEvent::TaskStateChange {
                task_instance_id,
                status,
                host,
            } => apply_task_state_change(ctx, runnable, task_instance_id, status, host, false)
                .await
                .map(|_| ()),
            WorkflowStateEvent::Pause
            | WorkflowStateEvent::Paused
            | WorkflowStateEvent::Stopped
            | WorkflowStateEvent::Succeed
            | WorkflowStateEvent::Failed
            | WorkflowStateEvent::TopologyTransition { .. }
            | WorkflowStateEvent::TriggerNextTask { .. } => {
                undefined_event(runnable, self.state(), &event)
            }
        }
    }
}
