//! The workflow state machine: one action per [`WorkflowExecutionStatus`].
//!
//! The action invoked for an event is chosen purely by the runnable's current
//! state. Each action matches the whole event vocabulary; events that mean
//! nothing in a state are logged and dropped. Shared behaviour lives in
//! [`common`] and is composed into the actions rather than inherited.

pub(crate) mod common;

mod failover;
mod finished;
mod paused;
mod ready_pause;
mod ready_stop;
mod running;
mod submitted;
mod waiting;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use db::models::WorkflowExecutionStatus;

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::WorkflowStateEvent;
use crate::runnable::WorkflowExecutionRunnable;

pub use failover::FailoverStateAction;
pub use finished::{FailedStateAction, StoppedStateAction, SuccessStateAction};
pub use paused::PausedStateAction;
pub use ready_pause::ReadyPauseStateAction;
pub use ready_stop::ReadyStopStateAction;
pub use running::RunningStateAction;
pub use submitted::SubmittedStateAction;
pub use waiting::{SerialWaitStateAction, WaitToRunStateAction};

#[async_trait]
pub trait WorkflowStateAction: Send + Sync {
    /// The state this action handles.
    fn state(&self) -> WorkflowExecutionStatus;

    async fn handle(
        &self,
        ctx: &EngineContext,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError>;
}

/// Lookup table from state to action, validated to cover every state.
pub struct StateActionTable {
    actions: HashMap<WorkflowExecutionStatus, Arc<dyn WorkflowStateAction>>,
}

impl StateActionTable {
    /// # Errors
    /// - [`EngineError::DuplicateStateAction`] if two actions claim a state.
    /// - [`EngineError::MissingStateAction`] if a state has no action.
    pub fn new(actions: Vec<Arc<dyn WorkflowStateAction>>) -> Result<Self, EngineError> {
        let mut table = HashMap::with_capacity(actions.len());
        for action in actions {
            let state = action.state();
            if table.insert(state, action).is_some() {
                return Err(EngineError::DuplicateStateAction(state));
            }
        }
        if let Some(missing) = WorkflowExecutionStatus::ALL
            .into_iter()
            .find(|state| !table.contains_key(state))
        {
            return Err(EngineError::MissingStateAction(missing));
        }
        Ok(Self { actions: table })
    }

    /// The production table.
    pub fn standard() -> Result<Self, EngineError> {
        Self::new(vec![
            Arc::new(SubmittedStateAction),
            Arc::new(RunningStateAction),
            Arc::new(ReadyPauseStateAction),
            Arc::new(PausedStateAction),
            Arc::new(ReadyStopStateAction),
            Arc::new(StoppedStateAction),
            Arc::new(SerialWaitStateAction),
            Arc::new(FailedStateAction),
            Arc::new(SuccessStateAction),
            Arc::new(FailoverStateAction),
            Arc::new(WaitToRunStateAction),
        ])
    }

    /// # Panics
    /// Never for a table built by [`StateActionTable::new`].
    pub fn action(&self, state: WorkflowExecutionStatus) -> &Arc<dyn WorkflowStateAction> {
        self.actions
            .get(&state)
            .unwrap_or_else(|| panic!("no state action registered for {state}"))
    }
}
