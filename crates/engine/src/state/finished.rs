//! Actions for the three terminal states. A finished runnable only lives
//! until `Finalize` is handled, unless it was re-admitted for recovery.

use std::sync::Arc;

use async_trait::async_trait;
use db::models::WorkflowExecutionStatus;
use tracing::info;

use super::common::{
    apply_task_state_change, assert_state, emit, emit_trigger_pending, finalize, transition,
    undefined_event,
};
use super::WorkflowStateAction;
use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::WorkflowStateEvent;
use crate::runnable::WorkflowExecutionRunnable;

/// Re-run what did not succeed: back to `Running`, reset failed, killed and
/// paused tasks and trigger whatever became runnable.
async fn recover(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
) -> Result<(), EngineError> {
    transition(ctx, runnable, WorkflowExecutionStatus::Running).await?;
    let reset = runnable.graph().reset_for_rerun();
    info!(workflow_instance_id = runnable.id(), ?reset, "recovering workflow");
    emit_trigger_pending(runnable)
}

pub struct StoppedStateAction;

#[async_trait]
impl WorkflowStateAction for StoppedStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::Stopped
    }

    async fn handle(
        &self,
        ctx: &EngineContext,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        assert_state(runnable, self.state());
        match event {
            WorkflowStateEvent::Start => recover(ctx, runnable).await,
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
            | WorkflowStateEvent::Stop
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

pub struct FailedStateAction;

#[async_trait]
impl WorkflowStateAction for FailedStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::Failed
    }

    async fn handle(
        &self,
        ctx: &EngineContext,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        assert_state(runnable, self.state());
        match event {
            WorkflowStateEvent::Start => recover(ctx, runnable).await,
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
            | WorkflowStateEvent::Stop
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

pub struct SuccessStateAction;

#[async_trait]
impl WorkflowStateAction for SuccessStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::Success
    }

    async fn handle(
        &self,
        ctx: &EngineContext,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        assert_state(runnable, self.state());
        match event {
            // Nothing left to run.
            WorkflowStateEvent::Start => emit(runnable, WorkflowStateEvent::Finalize),
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
            | WorkflowStateEvent::Stop
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
