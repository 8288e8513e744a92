use std::sync::Arc;

use async_trait::async_trait;
use db::models::WorkflowExecutionStatus;

use super::common::{
    assert_state, emit_trigger_pending, transition, undefined_event, workflow_finish,
};
use super::WorkflowStateAction;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::WorkflowStateEvent;
use crate::runnable::WorkflowExecutionRunnable;

/// Admitted but not started yet.
pub struct SubmittedStateAction;

#[async_trait]
impl WorkflowStateAction for SubmittedStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::Submitted
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
                emit_trigger_pending(runnable)
            }
            WorkflowStateEvent::Stop => {
                workflow_finish(ctx, runnable, WorkflowExecutionStatus::Stopped).await
            }
            WorkflowStateEvent::Pause
            | WorkflowStateEvent::Paused
            | WorkflowStateEvent::Stopped
            | WorkflowStateEvent::Succeed
            | WorkflowStateEvent::Failed
            | WorkflowStateEvent::Finalize
            | WorkflowStateEvent::TopologyTransition { .. }
            | WorkflowStateEvent::TriggerNextTask { .. }
            | WorkflowStateEvent::TaskStateChange { .. } => {
                undefined_event(runnable, self.state(), &event)
            }
        }
    }
}
