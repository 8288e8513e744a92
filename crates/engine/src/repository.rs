//! Per-instance event repository.

use queue::{EventQueue, QueueError};
use tracing::debug;

use crate::error::EngineError;
use crate::event::WorkflowEvent;

/// FIFO of pending events for one workflow instance. Any thread may push;
/// the engine guarantees a single drainer at a time.
pub struct EventRepository {
    workflow_instance_id: i64,
    queue: EventQueue<WorkflowEvent>,
}

impl EventRepository {
    pub fn new(workflow_instance_id: i64) -> Self {
        Self {
            workflow_instance_id,
            queue: EventQueue::new(),
        }
    }

    /// Append an event.
    ///
    /// # Errors
    /// [`EngineError::RepositoryClosed`] once the instance has finalized.
    pub fn push_tail(&self, event: WorkflowEvent) -> Result<(), EngineError> {
        self.queue
            .push_tail(event)
            .map_err(|QueueError::Closed| EngineError::RepositoryClosed(self.workflow_instance_id))
    }

    /// Put an event back at the front so it is retried before anything else.
    pub fn push_head(&self, event: WorkflowEvent) -> Result<(), EngineError> {
        self.queue
            .push_head(event)
            .map_err(|QueueError::Closed| EngineError::RepositoryClosed(self.workflow_instance_id))
    }

    pub fn pop(&self) -> Option<WorkflowEvent> {
        self.queue.pop()
    }

    pub fn size(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Reject further pushes and drop whatever is still queued.
    pub fn close(&self) {
        let dropped = self.queue.close();
        if dropped > 0 {
            debug!(
                workflow_instance_id = self.workflow_instance_id,
                dropped, "dropped events of finalized workflow"
            );
        }
    }
}
