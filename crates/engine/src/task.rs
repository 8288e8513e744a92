//! Live execution state of one task node.

use db::models::{TaskDefinition, TaskExecutionStatus, TaskInstance};

/// Where a node stands in the graph walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeFlow {
    /// Not triggered yet.
    Pending,
    /// Triggered; runs (or ran) on a worker.
    Active,
    /// Triggered but skipped or forbidden, so it never runs.
    Inactive,
}

/// One task node of a running workflow instance together with its latest
/// attempt. Owned by the [`ExecutionGraph`](crate::graph::ExecutionGraph).
#[derive(Debug, Clone)]
pub struct TaskExecutionRunnable {
    definition: TaskDefinition,
    flow: NodeFlow,
    skipped: bool,
    instance: Option<TaskInstance>,
}

impl TaskExecutionRunnable {
    pub fn new(definition: TaskDefinition) -> Self {
        Self {
            definition,
            flow: NodeFlow::Pending,
            skipped: false,
            instance: None,
        }
    }

    pub fn code(&self) -> i64 {
        self.definition.code
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &TaskDefinition {
        &self.definition
    }

    pub fn flow(&self) -> NodeFlow {
        self.flow
    }

    pub(crate) fn set_flow(&mut self, flow: NodeFlow) {
        self.flow = flow;
    }

    pub fn is_forbidden(&self) -> bool {
        self.definition.forbidden
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    pub(crate) fn set_skipped(&mut self) {
        self.skipped = true;
    }

    pub fn is_conditional(&self) -> bool {
        self.definition.condition.is_some()
    }

    /// Latest attempt, if the task was ever started.
    pub fn instance(&self) -> Option<&TaskInstance> {
        self.instance.as_ref()
    }

    pub(crate) fn set_instance(&mut self, instance: TaskInstance) {
        self.instance = Some(instance);
    }

    pub(crate) fn clear_instance(&mut self) {
        self.instance = None;
    }

    pub fn status(&self) -> Option<TaskExecutionStatus> {
        self.instance.as_ref().map(|instance| instance.status)
    }

    pub fn host(&self) -> Option<&str> {
        self.instance.as_ref().and_then(|instance| instance.host.as_deref())
    }

    /// Active and not yet reported finished by its worker.
    pub fn is_in_flight(&self) -> bool {
        self.flow == NodeFlow::Active
            && self.status().map_or(true, TaskExecutionStatus::is_in_flight)
    }
}
