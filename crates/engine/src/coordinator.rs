//! Entry points exposed to the outside world: submit commands, operate on
//! running instances and accept task status reports from workers.

use std::sync::Arc;

use chrono::Utc;
use db::models::{
    Command, CommandType, ExecutionMode, TaskExecutionStatus, TaskInstance, WorkflowDefinition,
    WorkflowExecutionStatus, WorkflowInstance,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::context::EngineContext;
use crate::dispatcher::EventDispatcher;
use crate::error::EngineError;
use crate::event::{OperationKind, WorkflowEvent, WorkflowStateEvent};
use crate::graph::{validate_dag, ExecutionGraph};
use crate::runnable::WorkflowExecutionRunnable;

/// A worker's report about one task attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEventReport {
    pub workflow_instance_id: i64,
    pub task_instance_id: i64,
    pub status: TaskExecutionStatus,
    #[serde(default)]
    pub host: Option<String>,
}

pub struct WorkflowCoordinator {
    ctx: EngineContext,
    dispatcher: EventDispatcher,
}

impl WorkflowCoordinator {
    pub fn new(ctx: EngineContext) -> Self {
        let dispatcher = EventDispatcher::new(ctx.clone());
        Self { ctx, dispatcher }
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    /// Validate and store a workflow definition.
    pub async fn register_definition(&self, definition: &WorkflowDefinition) -> Result<(), EngineError> {
        validate_dag(definition)?;
        self.ctx.store.save_workflow_definition(definition).await?;
        info!(code = definition.code, version = definition.version, "workflow definition registered");
        Ok(())
    }

    /// Admit a new or recovered workflow instance and return its id.
    ///
    /// # Errors
    /// - [`EngineError::Graph`] if the definition (or start-node list) is invalid.
    /// - [`EngineError::InvalidCommand`] if the instance cannot take this command.
    /// - [`EngineError::AlreadyRunning`] if the instance is live on this master.
    #[instrument(skip(self, command), fields(command_type = ?command.command_type))]
    pub async fn submit(&self, command: Command) -> Result<i64, EngineError> {
        match command.command_type {
            CommandType::Start => self.start_new(command).await,
            CommandType::Resume => {
                self.recover(&command, &[WorkflowExecutionStatus::Paused]).await
            }
            CommandType::RecoverFailed => {
                self.recover(
                    &command,
                    &[WorkflowExecutionStatus::Failed, WorkflowExecutionStatus::Stopped],
                )
                .await
            }
            CommandType::RecoverFailover => {
                let id = require_instance_id(&command)?;
                let instance = self.ctx.store.load_workflow_instance(id).await?;
                if instance.state.is_finished() {
                    return Err(EngineError::InvalidCommand(format!(
                        "workflow instance {id} already finished as {}",
                        instance.state
                    )));
                }
                self.adopt_failover(instance).await?;
                Ok(id)
            }
        }
    }

    /// Queue a pause, kill or trigger for a live instance.
    pub fn operate(&self, workflow_instance_id: i64, kind: OperationKind) -> Result<(), EngineError> {
        info!(workflow_instance_id, ?kind, "workflow operation requested");
        self.dispatcher
            .dispatch(WorkflowEvent::operation(workflow_instance_id, kind))
    }

    pub fn report_task_event(&self, report: TaskEventReport) -> Result<(), EngineError> {
        self.dispatcher.dispatch(WorkflowEvent::task_state_change(
            report.workflow_instance_id,
            report.task_instance_id,
            report.status,
            report.host,
        ))
    }

    /// Current row of an instance: the live copy if it runs here, otherwise
    /// the stored one.
    pub async fn workflow_instance(&self, id: i64) -> Result<WorkflowInstance, EngineError> {
        match self.ctx.runnables.get(id) {
            Some(runnable) => Ok(runnable.instance()),
            None => Ok(self.ctx.store.load_workflow_instance(id).await?),
        }
    }

    pub async fn task_instances(&self, workflow_instance_id: i64) -> Result<Vec<TaskInstance>, EngineError> {
        Ok(self.ctx.store.list_task_instances(workflow_instance_id).await?)
    }

    async fn start_new(&self, command: Command) -> Result<i64, EngineError> {
        let definition = self
            .ctx
            .store
            .load_workflow_definition(command.definition_code, command.definition_version)
            .await?;
        let graph = ExecutionGraph::new(&definition, &command.start_nodes)?;

        let state = match command.execution_mode {
            ExecutionMode::Parallel => WorkflowExecutionStatus::Submitted,
            ExecutionMode::Serial => WorkflowExecutionStatus::SerialWait,
            ExecutionMode::WaitForResources => WorkflowExecutionStatus::WaitToRun,
        };
        let now = Utc::now();
        let mut instance = WorkflowInstance {
            id: 0,
            name: format!("{}-{}", definition.name, now.format("%Y%m%d%H%M%S%3f")),
            definition_code: definition.code,
            definition_version: definition.version,
            state,
            command_type: CommandType::Start,
            host: Some(self.ctx.host().to_string()),
            start_time: now,
            end_time: None,
            restart_time: None,
            failure_strategy: command.failure_strategy,
            warning_type: command.warning_type,
            warning_recipients: definition.warning_recipients.clone(),
            timeout_minutes: definition.timeout_minutes,
            start_nodes: command.start_nodes,
        };
        // A new instance has no task rows to restore, so the insert is its
        // last store call.
        instance.id = self.ctx.store.create_workflow_instance(&instance).await?;
        let id = instance.id;
        self.launch(instance, definition, graph)?;
        Ok(id)
    }

    async fn recover(
        &self,
        command: &Command,
        allowed: &[WorkflowExecutionStatus],
    ) -> Result<i64, EngineError> {
        let id = require_instance_id(command)?;
        if self.ctx.runnables.contains(id) {
            return Err(EngineError::AlreadyRunning(id));
        }
        let mut instance = self.ctx.store.load_workflow_instance(id).await?;
        if !allowed.contains(&instance.state) {
            return Err(EngineError::InvalidCommand(format!(
                "{:?} is not allowed for workflow instance {id} in state {}",
                command.command_type, instance.state
            )));
        }
        let (definition, graph) = self.restore(&instance).await?;
        instance.command_type = command.command_type;
        instance.host = Some(self.ctx.host().to_string());
        self.ctx.store.update_workflow_instance(&instance).await?;
        self.launch(instance, definition, graph)?;
        Ok(id)
    }

    /// Take over an instance whose master is gone and resume it here.
    pub(crate) async fn adopt_failover(&self, mut instance: WorkflowInstance) -> Result<(), EngineError> {
        if self.ctx.runnables.contains(instance.id) {
            return Err(EngineError::AlreadyRunning(instance.id));
        }
        let (definition, graph) = self.restore(&instance).await?;
        let previous_host = instance.host.clone();
        instance.state = WorkflowExecutionStatus::Failover;
        instance.command_type = CommandType::RecoverFailover;
        instance.host = Some(self.ctx.host().to_string());
        instance.restart_time = Some(Utc::now());
        self.ctx.store.update_workflow_instance(&instance).await?;
        info!(
            workflow_instance_id = instance.id,
            previous_host = ?previous_host,
            "adopting workflow instance"
        );
        self.launch(instance, definition, graph)
    }

    /// Rebuild the graph of a stored instance from its task rows. Only
    /// reads, so it runs before the instance row is rewritten: a failure here
    /// leaves the row as it was and the command can be retried.
    async fn restore(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(WorkflowDefinition, ExecutionGraph), EngineError> {
        let definition = self
            .ctx
            .store
            .load_workflow_definition(instance.definition_code, instance.definition_version)
            .await?;
        let mut graph = ExecutionGraph::new(&definition, &instance.start_nodes)?;
        graph.restore(self.ctx.store.list_task_instances(instance.id).await?);
        Ok((definition, graph))
    }

    /// Register the runnable and start it. No store access, so nothing can
    /// fail transiently once the instance row was written.
    fn launch(
        &self,
        instance: WorkflowInstance,
        definition: WorkflowDefinition,
        graph: ExecutionGraph,
    ) -> Result<(), EngineError> {
        let id = instance.id;
        let waits_for_serial = instance.state == WorkflowExecutionStatus::SerialWait
            && self.has_earlier_live_instance(definition.code, id);
        let runnable = Arc::new(WorkflowExecutionRunnable::new(instance, definition, graph));
        if !self.ctx.runnables.insert(runnable) {
            return Err(EngineError::AlreadyRunning(id));
        }
        if waits_for_serial {
            info!(workflow_instance_id = id, "waiting for earlier serial instance");
            return Ok(());
        }
        self.dispatcher
            .dispatch(WorkflowEvent::state(id, WorkflowStateEvent::Start))
    }

    fn has_earlier_live_instance(&self, definition_code: i64, id: i64) -> bool {
        self.ctx
            .runnables
            .snapshot()
            .iter()
            .any(|other| other.definition().code == definition_code && other.id() < id)
    }
}

fn require_instance_id(command: &Command) -> Result<i64, EngineError> {
    command.workflow_instance_id.ok_or_else(|| {
        EngineError::InvalidCommand(format!(
            "{:?} requires a workflow instance id",
            command.command_type
        ))
    })
}
