//! Drains one workflow instance's event repository.
//!
//! Synchronous events run inline, in order, so each sees the state left by
//! the previous one. Asynchronous events (worker calls, alerts) are handed to
//! a bounded pool and not awaited.

use std::sync::Arc;

use db::models::TaskExecutionStatus;
use nodes::{ExecutorError, TaskDispatchRequest};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument, warn};

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::{Capability, EventPayload, TaskOperationKind, WorkflowEvent, WorkflowStateEvent};
use crate::runnable::WorkflowExecutionRunnable;
use crate::state::StateActionTable;

/// Result of one drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Drain {
    /// Events popped, including one that was requeued.
    pub fired: usize,
    /// The drain stopped early on a transient failure.
    pub requeued: bool,
}

pub struct EventFirer {
    ctx: EngineContext,
    actions: Arc<StateActionTable>,
    async_permits: Arc<Semaphore>,
}

impl EventFirer {
    pub fn new(ctx: EngineContext, actions: Arc<StateActionTable>) -> Self {
        let async_permits = Arc::new(Semaphore::new(ctx.config.async_pool_size.max(1)));
        Self {
            ctx,
            actions,
            async_permits,
        }
    }

    /// Pop and handle events until the repository is empty. Returns the
    /// number of events popped.
    pub async fn fire_active(&self, runnable: &Arc<WorkflowExecutionRunnable>) -> usize {
        self.drain(runnable).await.fired
    }

    #[instrument(skip_all, fields(workflow_instance_id = runnable.id()))]
    pub async fn drain(&self, runnable: &Arc<WorkflowExecutionRunnable>) -> Drain {
        let mut fired = 0;
        while let Some(event) = runnable.repository().pop() {
            fired += 1;
            if event.capability() == Capability::Async {
                self.spawn_async(runnable, event);
                continue;
            }
            let Some(state_event) = event.payload.state_event() else {
                error!(event_id = %event.event_id, "synchronous event has no lifecycle meaning, dropping it");
                continue;
            };

            let result = self.handle_sync(runnable, &event, state_event).await;
            let Err(err) = result else {
                continue;
            };
            if err.is_transient() {
                warn!(event_id = %event.event_id, error = %err, "transient failure, event requeued");
                if let Err(closed) = runnable.repository().push_head(event) {
                    debug!(error = %closed, "repository closed while requeueing");
                }
                return Drain {
                    fired,
                    requeued: true,
                };
            }
            error!(event_id = %event.event_id, error = %err, "failed to handle event, dropping it");
        }
        Drain {
            fired,
            requeued: false,
        }
    }

    async fn handle_sync(
        &self,
        runnable: &Arc<WorkflowExecutionRunnable>,
        event: &WorkflowEvent,
        state_event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        let state = runnable.state();
        debug!(
            event_id = %event.event_id,
            %state,
            event = state_event.name(),
            "handling event"
        );
        self.actions
            .action(state)
            .handle(&self.ctx, runnable, state_event)
            .await
    }

    fn spawn_async(&self, runnable: &Arc<WorkflowExecutionRunnable>, event: WorkflowEvent) {
        let ctx = self.ctx.clone();
        let permits = Arc::clone(&self.async_permits);
        let runnable = Arc::clone(runnable);
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            match event.payload {
                EventPayload::TaskOperation {
                    task_code,
                    task_instance_id,
                    kind: TaskOperationKind::Dispatch,
                } => dispatch_task(&ctx, &runnable, task_code, task_instance_id).await,
                EventPayload::TaskOperation {
                    task_code,
                    task_instance_id,
                    kind,
                } => signal_task(&ctx, &runnable, task_code, task_instance_id, kind).await,
                EventPayload::Timeout => {
                    let instance = runnable.instance();
                    if let Err(err) = ctx.alerts.send_timeout_alert(&instance).await {
                        warn!(workflow_instance_id = instance.id, error = %err, "failed to send timeout alert");
                    }
                }
                EventPayload::State(_) | EventPayload::Operation(_) => {}
            }
        });
    }
}

/// Push an event produced outside the drain and wake the engine.
fn requeue(ctx: &EngineContext, runnable: &WorkflowExecutionRunnable, event: WorkflowEvent) {
    match runnable.repository().push_tail(event) {
        Ok(()) => ctx.wakeup.notify_one(),
        Err(err) => debug!(error = %err, "workflow finalized, dropping event"),
    }
}

async fn dispatch_task(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    task_code: i64,
    task_instance_id: i64,
) {
    let request = {
        let graph = runnable.graph();
        let task = graph.task(task_code);
        match task.instance() {
            Some(instance)
                if instance.id == task_instance_id
                    && instance.status == TaskExecutionStatus::Submitted
                    && instance.host.is_none() =>
            {
                let definition = task.definition();
                Some(TaskDispatchRequest {
                    workflow_instance_id: runnable.id(),
                    task_instance_id,
                    task_code,
                    name: definition.name.clone(),
                    task_type: definition.task_type.clone(),
                    params: definition.params.clone(),
                    retry_times: instance.retry_times,
                    delay_secs: if instance.retry_times > 0 {
                        definition.retry_interval_secs
                    } else {
                        0
                    },
                })
            }
            _ => None,
        }
    };
    let Some(request) = request else {
        debug!(
            workflow_instance_id = runnable.id(),
            task_instance_id, "task attempt no longer awaits dispatch"
        );
        return;
    };

    match ctx.executor.dispatch(&request).await {
        Ok(host) => {
            info!(
                workflow_instance_id = runnable.id(),
                task_code,
                task_instance_id,
                %host,
                "task dispatched"
            );
            requeue(
                ctx,
                runnable,
                WorkflowEvent::task_state_change(
                    runnable.id(),
                    task_instance_id,
                    TaskExecutionStatus::Dispatch,
                    Some(host),
                ),
            );
        }
        Err(ExecutorError::Retryable(reason)) => {
            warn!(
                workflow_instance_id = runnable.id(),
                task_instance_id,
                %reason,
                "dispatch rejected, retrying"
            );
            tokio::time::sleep(ctx.config.dispatch_retry_interval).await;
            requeue(
                ctx,
                runnable,
                WorkflowEvent::task_operation(
                    runnable.id(),
                    task_code,
                    task_instance_id,
                    TaskOperationKind::Dispatch,
                ),
            );
        }
        Err(ExecutorError::Fatal(reason)) => {
            error!(
                workflow_instance_id = runnable.id(),
                task_instance_id,
                %reason,
                "dispatch failed permanently"
            );
            requeue(
                ctx,
                runnable,
                WorkflowEvent::task_state_change(
                    runnable.id(),
                    task_instance_id,
                    TaskExecutionStatus::Failure,
                    None,
                ),
            );
        }
    }
}

/// Best-effort kill or pause on the worker holding the attempt.
async fn signal_task(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    task_code: i64,
    task_instance_id: i64,
    kind: TaskOperationKind,
) {
    let host = {
        let graph = runnable.graph();
        graph
            .task(task_code)
            .instance()
            .filter(|instance| instance.id == task_instance_id)
            .and_then(|instance| instance.host.clone())
    };
    let Some(host) = host else {
        debug!(task_instance_id, ?kind, "task attempt has no worker, nothing to signal");
        return;
    };
    let result = match kind {
        TaskOperationKind::Pause => ctx.executor.pause(&host, task_instance_id).await,
        TaskOperationKind::Kill | TaskOperationKind::Dispatch => {
            ctx.executor.kill(&host, task_instance_id).await
        }
    };
    if let Err(err) = result {
        warn!(
            workflow_instance_id = runnable.id(),
            task_instance_id,
            %host,
            ?kind,
            error = %err,
            "failed to signal worker"
        );
    }
}
