//! Workflow events and their routing capability.
//!
//! Every event is addressed to exactly one workflow instance. Synchronous
//! events are handled inline by the instance's current state action;
//! asynchronous events are handed to a worker pool so a slow worker call
//! never blocks the instance's queue.

use db::models::TaskExecutionStatus;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How the firer executes an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Sync,
    Async,
}

/// Lifecycle events interpreted by the state-action table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowStateEvent {
    Start,
    Pause,
    Paused,
    Stop,
    Stopped,
    Succeed,
    Failed,
    Finalize,
    /// A task finished (or was passed over); walk the graph past it.
    TopologyTransition { task_code: i64 },
    /// Trigger successors of `parent_task_code`, or every runnable pending
    /// node when `None`.
    TriggerNextTask { parent_task_code: Option<i64> },
    /// Status report for one task attempt.
    TaskStateChange {
        task_instance_id: i64,
        status: TaskExecutionStatus,
        host: Option<String>,
    },
}

impl WorkflowStateEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Paused => "paused",
            Self::Stop => "stop",
            Self::Stopped => "stopped",
            Self::Succeed => "succeed",
            Self::Failed => "failed",
            Self::Finalize => "finalize",
            Self::TopologyTransition { .. } => "topology_transition",
            Self::TriggerNextTask { .. } => "trigger_next_task",
            Self::TaskStateChange { .. } => "task_state_change",
        }
    }
}

/// External operations on a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Trigger,
    Pause,
    Kill,
}

impl OperationKind {
    /// The lifecycle event an operation stands for.
    pub fn as_state_event(self) -> WorkflowStateEvent {
        match self {
            Self::Trigger => WorkflowStateEvent::Start,
            Self::Pause => WorkflowStateEvent::Pause,
            Self::Kill => WorkflowStateEvent::Stop,
        }
    }
}

/// Worker-bound instructions for one task attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOperationKind {
    Dispatch,
    Kill,
    Pause,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    State(WorkflowStateEvent),
    Operation(OperationKind),
    TaskOperation {
        task_code: i64,
        task_instance_id: i64,
        kind: TaskOperationKind,
    },
    Timeout,
}

impl EventPayload {
    pub fn capability(&self) -> Capability {
        match self {
            Self::State(_) | Self::Operation(_) => Capability::Sync,
            Self::TaskOperation { .. } | Self::Timeout => Capability::Async,
        }
    }

    /// The lifecycle event a synchronous payload is handled as.
    pub fn state_event(&self) -> Option<WorkflowStateEvent> {
        match self {
            Self::State(event) => Some(event.clone()),
            Self::Operation(kind) => Some(kind.as_state_event()),
            Self::TaskOperation { .. } | Self::Timeout => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowEvent {
    pub event_id: Uuid,
    pub workflow_instance_id: i64,
    pub payload: EventPayload,
}

impl WorkflowEvent {
    pub fn new(workflow_instance_id: i64, payload: EventPayload) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            workflow_instance_id,
            payload,
        }
    }

    pub fn state(workflow_instance_id: i64, event: WorkflowStateEvent) -> Self {
        Self::new(workflow_instance_id, EventPayload::State(event))
    }

    pub fn operation(workflow_instance_id: i64, kind: OperationKind) -> Self {
        Self::new(workflow_instance_id, EventPayload::Operation(kind))
    }

    pub fn task_operation(
        workflow_instance_id: i64,
        task_code: i64,
        task_instance_id: i64,
        kind: TaskOperationKind,
    ) -> Self {
        Self::new(
            workflow_instance_id,
            EventPayload::TaskOperation {
                task_code,
                task_instance_id,
                kind,
            },
        )
    }

    pub fn timeout(workflow_instance_id: i64) -> Self {
        Self::new(workflow_instance_id, EventPayload::Timeout)
    }

    pub fn task_state_change(
        workflow_instance_id: i64,
        task_instance_id: i64,
        status: TaskExecutionStatus,
        host: Option<String>,
    ) -> Self {
        Self::state(
            workflow_instance_id,
            WorkflowStateEvent::TaskStateChange {
                task_instance_id,
                status,
                host,
            },
        )
    }

    pub fn capability(&self) -> Capability {
        self.payload.capability()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_and_operations_are_synchronous() {
        assert_eq!(
            WorkflowEvent::state(1, WorkflowStateEvent::Start).capability(),
            Capability::Sync
        );
        assert_eq!(
            WorkflowEvent::operation(1, OperationKind::Kill).capability(),
            Capability::Sync
        );
        assert_eq!(
            WorkflowEvent::task_operation(1, 2, 3, TaskOperationKind::Dispatch).capability(),
            Capability::Async
        );
        assert_eq!(WorkflowEvent::timeout(1).capability(), Capability::Async);
    }

    #[test]
    fn only_synchronous_payloads_carry_a_lifecycle_event() {
        let payloads = [
            EventPayload::State(WorkflowStateEvent::Finalize),
            EventPayload::Operation(OperationKind::Pause),
            EventPayload::TaskOperation {
                task_code: 2,
                task_instance_id: 3,
                kind: TaskOperationKind::Kill,
            },
            EventPayload::Timeout,
        ];
        for payload in payloads {
            let sync = payload.capability() == Capability::Sync;
            assert_eq!(payload.state_event().is_some(), sync, "{payload:?}");
        }
    }

    #[test]
    fn operations_map_onto_lifecycle_events() {
        assert_eq!(OperationKind::Trigger.as_state_event(), WorkflowStateEvent::Start);
        assert_eq!(OperationKind::Pause.as_state_event(), WorkflowStateEvent::Pause);
        assert_eq!(OperationKind::Kill.as_state_event(), WorkflowStateEvent::Stop);
    }

    #[test]
    fn every_event_gets_a_fresh_id() {
        let a = WorkflowEvent::state(1, WorkflowStateEvent::Start);
        let b = WorkflowEvent::state(1, WorkflowStateEvent::Start);
        assert_ne!(a.event_id, b.event_id);
    }
}
