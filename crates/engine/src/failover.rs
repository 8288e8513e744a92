//! Periodic reconciliation of work orphaned by dead masters and workers.
//!
//! Both passes are idempotent: whether an instance or task still needs
//! failover is derived from persisted timestamps compared with the
//! registry's server startup times, so a pass interrupted by a crash is
//! simply repeated by the next one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use db::models::{TaskExecutionStatus, TaskInstance, WorkflowInstance};
use registry::{master_failover_lock_path, NodeType, RegistryClient};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::background::shutdown_requested;
use crate::context::EngineContext;
use crate::coordinator::WorkflowCoordinator;
use crate::error::EngineError;
use crate::event::WorkflowEvent;
use crate::runnable::WorkflowExecutionRunnable;

pub struct FailoverService {
    ctx: EngineContext,
    coordinator: Arc<WorkflowCoordinator>,
    registry: Arc<dyn RegistryClient>,
}

impl FailoverService {
    pub fn new(
        ctx: EngineContext,
        coordinator: Arc<WorkflowCoordinator>,
        registry: Arc<dyn RegistryClient>,
    ) -> Self {
        Self {
            ctx,
            coordinator,
            registry,
        }
    }

    // -----------------------------------------------------------------------
    // Master failover
    // -----------------------------------------------------------------------

    /// Adopt unfinished instances of dead masters (and of this master's
    /// previous life). Returns the number of instances adopted.
    pub async fn failover_masters(&self) -> Result<usize, EngineError> {
        let hosts = self.ctx.store.query_failover_hosts().await?;
        let mut adopted = 0;
        for host in hosts {
            let is_self = host == self.ctx.host();
            if !is_self && self.registry.is_node_alive(&host, NodeType::Master).await? {
                continue;
            }
            adopted += self.failover_master(&host).await?;
        }
        Ok(adopted)
    }

    #[instrument(skip(self))]
    async fn failover_master(&self, host: &str) -> Result<usize, EngineError> {
        let lock_path = master_failover_lock_path(host);
        if !self.registry.acquire_lock(&lock_path).await? {
            info!("failover lock held by another master, skipping");
            return Ok(0);
        }
        let result = self.adopt_orphaned_instances(host).await;
        if let Err(err) = self.registry.release_lock(&lock_path).await {
            warn!(error = %err, "failed to release failover lock");
        }
        result
    }

    async fn adopt_orphaned_instances(&self, host: &str) -> Result<usize, EngineError> {
        let startup_time = self.startup_time(host, NodeType::Master).await?;
        let instances = self.ctx.store.query_instances_needing_failover(host).await?;
        let mut adopted = 0;
        for instance in instances {
            if !self.needs_master_failover(&instance, startup_time) {
                continue;
            }
            let workflow_instance_id = instance.id;
            match self.coordinator.adopt_failover(instance).await {
                Ok(()) => adopted += 1,
                Err(EngineError::AlreadyRunning(_)) => {
                    debug!(workflow_instance_id, "instance already running here");
                }
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => {
                    error!(workflow_instance_id, error = %err, "failed to adopt workflow instance");
                }
            }
        }
        if adopted > 0 {
            info!(adopted, "master failover finished");
        }
        Ok(adopted)
    }

    /// An instance needs failover iff it has an owner, and that owner either
    /// never came back or started it before its latest restart without the
    /// instance having been restarted since.
    fn needs_master_failover(
        &self,
        instance: &WorkflowInstance,
        startup_time: Option<DateTime<Utc>>,
    ) -> bool {
        if instance.host.is_none() || self.ctx.runnables.contains(instance.id) {
            return false;
        }
        match startup_time {
            None => true,
            Some(startup_time) => {
                instance.start_time < startup_time
                    && instance
                        .restart_time
                        .map_or(true, |restart_time| restart_time < startup_time)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Worker failover
    // -----------------------------------------------------------------------

    /// Mark in-flight tasks of dead or restarted workers as needing fault
    /// tolerance. Returns the number of tasks marked.
    pub async fn failover_workers(&self) -> Result<usize, EngineError> {
        let workers: HashMap<String, DateTime<Utc>> = self
            .registry
            .list_servers(NodeType::Worker)
            .await?
            .into_iter()
            .map(|server| (server.host, server.startup_time))
            .collect();

        let mut orphaned = 0;
        for runnable in self.ctx.runnables.snapshot() {
            let in_flight: Vec<TaskInstance> = {
                let graph = runnable.graph();
                graph
                    .tasks()
                    .filter(|task| task.is_in_flight())
                    .filter_map(|task| task.instance().cloned())
                    .filter(|instance| instance.host.is_some())
                    .collect()
            };
            for task in in_flight {
                if !needs_worker_failover(&task, &workers) {
                    continue;
                }
                self.orphan_task(&runnable, task).await?;
                orphaned += 1;
            }
        }
        if orphaned > 0 {
            info!(orphaned, "worker failover finished");
        }
        Ok(orphaned)
    }

    async fn orphan_task(
        &self,
        runnable: &WorkflowExecutionRunnable,
        mut task: TaskInstance,
    ) -> Result<(), EngineError> {
        let host = task.host.clone().unwrap_or_default();
        warn!(
            workflow_instance_id = runnable.id(),
            task_instance_id = task.id,
            %host,
            status = %task.status,
            "task lost its worker"
        );
        if self.ctx.config.kill_orphaned_tasks {
            if let Err(err) = self.ctx.executor.kill(&host, task.id).await {
                debug!(task_instance_id = task.id, error = %err, "best-effort kill failed");
            }
        }
        task.status = TaskExecutionStatus::NeedFaultTolerance;
        task.alive = false;
        task.end_time = Some(Utc::now());
        self.ctx.store.upsert_task_instance(&task).await?;

        let event = WorkflowEvent::task_state_change(
            runnable.id(),
            task.id,
            TaskExecutionStatus::NeedFaultTolerance,
            None,
        );
        if let Err(err) = self.coordinator.dispatcher().dispatch(event) {
            debug!(workflow_instance_id = runnable.id(), error = %err, "workflow gone before failover event");
        }
        Ok(())
    }

    async fn startup_time(
        &self,
        host: &str,
        node_type: NodeType,
    ) -> Result<Option<DateTime<Utc>>, EngineError> {
        Ok(self
            .registry
            .list_servers(node_type)
            .await?
            .into_iter()
            .find(|server| server.host == host)
            .map(|server| server.startup_time))
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.ctx.config.failover_interval.as_secs(),
            "starting failover service"
        );
        let mut ticker = interval(self.ctx.config.failover_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("failover service shutting down");
                    break;
                }
            }
            if let Err(err) = self.failover_masters().await {
                error!(error = %err, "master failover pass failed");
            }
            if let Err(err) = self.failover_workers().await {
                error!(error = %err, "worker failover pass failed");
            }
        }
    }
}

/// A task needs failover iff it is unfinished and its worker is gone or was
/// restarted after the task was submitted.
fn needs_worker_failover(task: &TaskInstance, workers: &HashMap<String, DateTime<Utc>>) -> bool {
    if task.status.is_finished() {
        return false;
    }
    let Some(host) = task.host.as_deref() else {
        return false;
    };
    match workers.get(host) {
        None => true,
        Some(startup_time) => task.submit_time < *startup_time,
    }
}
