//! Admission states: the instance waits for an earlier serial instance of
//! the same workflow, or for resources, before it starts.

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

async fn start(ctx: &EngineContext, runnable: &WorkflowExecutionRunnable) -> Result<(), EngineError> {
    transition(ctx, runnable, WorkflowExecutionStatus::Running).await?;
    emit_trigger_pending(runnable)
}

pub struct SerialWaitStateAction;

#[async_trait]
impl WorkflowStateAction for SerialWaitStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::SerialWait
    }

    async fn handle(
        &self,
        ctx: &EngineContext,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        assert_state(runnable, self.state());
        match event {
            WorkflowStateEvent::Start => start(ctx, runnable).await,
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

pub struct WaitToRunStateAction;

#[async_trait]
impl WorkflowStateAction for WaitToRunStateAction {
    fn state(&self) -> WorkflowExecutionStatus {
        WorkflowExecutionStatus::WaitToRun
    }

    async fn handle(
        &self,
        ctx: &EngineContext,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        assert_state(runnable, self.state());
        match event {
            WorkflowStateEvent::Start => start(ctx, runnable).await,
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
