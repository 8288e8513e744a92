use tracing::{debug, warn};

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::WorkflowEvent;

/// Routes an event to the repository of the runnable it addresses and
/// wakes the engine.
#[derive(Clone)]
pub struct EventDispatcher {
    ctx: EngineContext,
}

impl EventDispatcher {
    pub fn new(ctx: EngineContext) -> Self {
        Self { ctx }
    }

    /// # Errors
    /// [`EngineError::RunnableNotFound`] if the instance is not live on this
    /// master (it may already have finalized), or
    /// [`EngineError::RepositoryClosed`] if it is finalizing.
    pub fn dispatch(&self, event: WorkflowEvent) -> Result<(), EngineError> {
        let workflow_instance_id = event.workflow_instance_id;
        let Some(runnable) = self.ctx.runnables.get(workflow_instance_id) else {
            warn!(workflow_instance_id, event_id = %event.event_id, "no runnable for event");
            return Err(EngineError::RunnableNotFound(workflow_instance_id));
        };
        debug!(workflow_instance_id, event_id = %event.event_id, "event dispatched");
        runnable.repository().push_tail(event)?;
        self.ctx.wakeup.notify_one();
        Ok(())
    }
}
