//! Behaviour shared by every state action: triggering tasks, walking the
//! graph when a task finishes, synthesising terminal events and finishing
//! or finalizing the workflow.

use std::sync::Arc;

use chrono::Utc;
use db::models::{
    FailureStrategy, TaskExecutionStatus, TaskInstance, WorkflowExecutionStatus,
};
use tracing::{debug, info, warn};

use crate::context::EngineContext;
use crate::error::EngineError;
use crate::event::{TaskOperationKind, WorkflowEvent, WorkflowStateEvent};
use crate::graph::ExecutionGraph;
use crate::runnable::WorkflowExecutionRunnable;
use crate::task::NodeFlow;

/// Outcome of applying one task status report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskChange {
    /// Stale, duplicate or unknown report.
    Ignored,
    /// The task moved between in-flight statuses.
    Progressed,
    /// A new attempt of the task was started.
    Retrying,
    /// The task reached a final status.
    Finished(i64),
}

// ---------------------------------------------------------------------------
// Preconditions and plumbing
// ---------------------------------------------------------------------------

/// # Panics
/// If the runnable is not in `expected`. The firer selects actions by the
/// current state, so a mismatch means the instance was mutated concurrently.
pub(crate) fn assert_state(runnable: &WorkflowExecutionRunnable, expected: WorkflowExecutionStatus) {
    let actual = runnable.state();
    assert_eq!(
        actual,
        expected,
        "workflow instance {} is {actual}, but the {expected} action was invoked",
        runnable.id()
    );
}

pub(crate) fn undefined_event(
    runnable: &WorkflowExecutionRunnable,
    state: WorkflowExecutionStatus,
    event: &WorkflowStateEvent,
) -> Result<(), EngineError> {
    warn!(
        workflow_instance_id = runnable.id(),
        %state,
        event = event.name(),
        "event is not defined for the current state, dropping"
    );
    Ok(())
}

pub(crate) fn emit(
    runnable: &WorkflowExecutionRunnable,
    event: WorkflowStateEvent,
) -> Result<(), EngineError> {
    runnable
        .repository()
        .push_tail(WorkflowEvent::state(runnable.id(), event))
}

fn emit_task_operation(
    runnable: &WorkflowExecutionRunnable,
    task_code: i64,
    task_instance_id: i64,
    kind: TaskOperationKind,
) -> Result<(), EngineError> {
    runnable.repository().push_tail(WorkflowEvent::task_operation(
        runnable.id(),
        task_code,
        task_instance_id,
        kind,
    ))
}

/// Persist the new state, then apply it in memory.
///
/// Work that may fail after this must either be queued as an event the new
/// state handles, or be repeatable when the original event is requeued into
/// the new state.
pub(crate) async fn transition(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    to: WorkflowExecutionStatus,
) -> Result<(), EngineError> {
    let mut next = runnable.instance();
    let from = next.state;
    next.state = to;
    if !to.is_finished() {
        next.end_time = None;
    }
    ctx.store.update_workflow_instance(&next).await?;
    runnable.set_instance(next);
    runnable.reset_finishing();
    info!(workflow_instance_id = runnable.id(), %from, %to, "workflow state transition");
    Ok(())
}

// ---------------------------------------------------------------------------
// Triggering
// ---------------------------------------------------------------------------

/// Start every candidate whose predecessors are resolved. Skipped and
/// forbidden candidates are passed over with a synthetic
/// `TopologyTransition` so their successors are evaluated right away. When
/// nothing could be triggered the workflow may be finished.
pub(crate) async fn trigger_tasks(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    candidates: impl IntoIterator<Item = i64>,
) -> Result<(), EngineError> {
    let mut to_start = Vec::new();
    let mut passed_over = Vec::new();
    {
        let mut graph = runnable.graph();
        for code in candidates {
            if graph.task(code).flow() != NodeFlow::Pending || !graph.is_trigger_condition_met(code)
            {
                continue;
            }
            let skip = graph.should_skip(code);
            if skip {
                graph.mark_skipped(code);
            }
            graph.mark_active(code);
            if skip || graph.task(code).is_forbidden() {
                graph.mark_inactive(code);
                passed_over.push((code, skip));
            } else {
                to_start.push(code);
            }
        }
    }

    for &(code, skipped) in &passed_over {
        debug!(
            workflow_instance_id = runnable.id(),
            task_code = code,
            skipped,
            "passing over task"
        );
        emit(runnable, WorkflowStateEvent::TopologyTransition { task_code: code })?;
    }

    for (index, &code) in to_start.iter().enumerate() {
        if let Err(err) = start_task(ctx, runnable, code, 0).await {
            let mut graph = runnable.graph();
            for &unstarted in &to_start[index..] {
                graph.mark_pending(unstarted);
            }
            return Err(err);
        }
    }

    if to_start.is_empty() && passed_over.is_empty() {
        try_emit_terminal(runnable)?;
    }
    Ok(())
}

/// Queue triggering of every pending node. Starting tasks runs as its own
/// event, so a transient failure is retried by `Running` rather than by the
/// state that just handed over.
pub(crate) fn emit_trigger_pending(runnable: &WorkflowExecutionRunnable) -> Result<(), EngineError> {
    emit(
        runnable,
        WorkflowStateEvent::TriggerNextTask {
            parent_task_code: None,
        },
    )
}

/// Persist a new attempt of `code` and queue its dispatch.
pub(crate) async fn start_task(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    code: i64,
    retry_times: u32,
) -> Result<i64, EngineError> {
    let definition = runnable.graph().task(code).definition().clone();
    let mut instance = TaskInstance {
        id: 0,
        workflow_instance_id: runnable.id(),
        task_code: code,
        name: definition.name,
        task_type: definition.task_type,
        status: TaskExecutionStatus::Submitted,
        host: None,
        retry_times,
        submit_time: Utc::now(),
        start_time: None,
        end_time: None,
        alive: true,
    };
    instance.id = ctx.store.upsert_task_instance(&instance).await?;
    let task_instance_id = instance.id;
    runnable.graph().record_instance(code, instance);

    info!(
        workflow_instance_id = runnable.id(),
        task_code = code,
        task_instance_id,
        retry_times,
        "task submitted"
    );
    emit_task_operation(runnable, code, task_instance_id, TaskOperationKind::Dispatch)?;
    Ok(task_instance_id)
}

/// Queue a dispatch for tasks that were persisted but never reached a worker.
pub(crate) fn redispatch_undispatched(runnable: &WorkflowExecutionRunnable) -> Result<(), EngineError> {
    let undispatched = runnable.graph().undispatched_tasks();
    for (code, task_instance_id) in undispatched {
        emit_task_operation(runnable, code, task_instance_id, TaskOperationKind::Dispatch)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Graph walk
// ---------------------------------------------------------------------------

/// React to `code` having finished or been passed over.
pub(crate) async fn on_task_finish(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    code: i64,
) -> Result<(), EngineError> {
    let stop_on_failure = runnable.instance().failure_strategy == FailureStrategy::End;
    let (end_of_chain, failed, successors) = {
        let mut graph = runnable.graph();
        let skipped = graph.apply_condition_branch(code);
        if !skipped.is_empty() {
            debug!(workflow_instance_id = runnable.id(), task_code = code, ?skipped, "condition branch chosen");
        }
        let task = graph.task(code);
        let failed =
            !task.is_conditional() && task.status() == Some(TaskExecutionStatus::Failure);
        (graph.is_end_of_chain(code), failed, graph.successors(code))
    };

    if failed && stop_on_failure {
        warn!(
            workflow_instance_id = runnable.id(),
            task_code = code,
            "task failed with failure strategy END, killing running tasks"
        );
        stop_in_flight_tasks(ctx, runnable, TaskOperationKind::Kill).await?;
    }

    let halted = stop_on_failure && runnable.graph().is_exist_failure_chain();
    if end_of_chain || halted {
        return try_emit_terminal(runnable);
    }
    trigger_tasks(ctx, runnable, successors).await
}

/// Ask workers to kill or pause every in-flight task. Tasks that never
/// reached a worker are settled locally.
pub(crate) async fn stop_in_flight_tasks(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    kind: TaskOperationKind,
) -> Result<(), EngineError> {
    let local_status = match kind {
        TaskOperationKind::Pause => TaskExecutionStatus::Paused,
        TaskOperationKind::Kill | TaskOperationKind::Dispatch => TaskExecutionStatus::Killed,
    };
    let in_flight = runnable.graph().in_flight_tasks();
    for (code, task_instance_id, host) in in_flight {
        if host.is_some() {
            emit_task_operation(runnable, code, task_instance_id, kind)?;
            continue;
        }
        let row = runnable.graph().task(code).instance().cloned();
        let Some(mut row) = row else {
            continue;
        };
        row.status = local_status;
        row.end_time = Some(Utc::now());
        ctx.store.upsert_task_instance(&row).await?;
        runnable.graph().record_instance(code, row);
        emit(runnable, WorkflowStateEvent::TopologyTransition { task_code: code })?;
    }
    Ok(())
}

/// Pause or kill everything in flight, then emit `fallback` (or whatever
/// pre-empts it) once nothing is left. Repeatable: tasks settled by an
/// earlier run are no longer in flight.
pub(crate) async fn drain_in_flight(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    kind: TaskOperationKind,
    fallback: WorkflowStateEvent,
) -> Result<(), EngineError> {
    stop_in_flight_tasks(ctx, runnable, kind).await?;
    emit_when_drained(runnable, fallback)
}

// ---------------------------------------------------------------------------
// Terminal events
// ---------------------------------------------------------------------------

/// Terminal event for a finished graph: Failed > Stopped > Paused > Succeed.
///
/// # Panics
/// If the graph is finished yet matches none of them.
pub(crate) fn terminal_event(graph: &ExecutionGraph) -> WorkflowStateEvent {
    if graph.is_exist_failure_chain() {
        WorkflowStateEvent::Failed
    } else if graph.is_exist_kill_chain() {
        WorkflowStateEvent::Stopped
    } else if graph.is_exist_pause_chain() {
        WorkflowStateEvent::Paused
    } else if graph.is_all_chain_success() {
        WorkflowStateEvent::Succeed
    } else {
        panic!("execution graph is finished but has no failed, killed, paused or successful outcome")
    }
}

/// Emit the terminal event once the whole graph is finished.
pub(crate) fn try_emit_terminal(runnable: &WorkflowExecutionRunnable) -> Result<(), EngineError> {
    let stop_on_failure = runnable.instance().failure_strategy == FailureStrategy::End;
    let event = {
        let graph = runnable.graph();
        let finished = if stop_on_failure && graph.is_exist_failure_chain() {
            !graph.has_in_flight()
        } else {
            graph.is_all_chain_finished()
        };
        if !finished {
            return Ok(());
        }
        terminal_event(&graph)
    };
    if !runnable.begin_finishing() {
        return Ok(());
    }
    debug!(workflow_instance_id = runnable.id(), event = event.name(), "graph finished");
    emit(runnable, event)
}

/// While pausing or stopping: once nothing is in flight, emit the outcome.
/// A failure or a fully successful graph pre-empts `fallback`.
pub(crate) fn emit_when_drained(
    runnable: &WorkflowExecutionRunnable,
    fallback: WorkflowStateEvent,
) -> Result<(), EngineError> {
    let event = {
        let graph = runnable.graph();
        if graph.has_in_flight() {
            return Ok(());
        }
        if graph.is_exist_failure_chain() {
            WorkflowStateEvent::Failed
        } else if graph.is_all_chain_success() {
            WorkflowStateEvent::Succeed
        } else {
            fallback
        }
    };
    if !runnable.begin_finishing() {
        return Ok(());
    }
    emit(runnable, event)
}

// ---------------------------------------------------------------------------
// Finish and finalize
// ---------------------------------------------------------------------------

/// Persist the final state with its end time, alert per the warning policy
/// and queue `Finalize`. Memory is untouched if persisting fails.
pub(crate) async fn workflow_finish(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    target: WorkflowExecutionStatus,
) -> Result<(), EngineError> {
    let mut finished = runnable.instance();
    let from = finished.state;
    finished.state = target;
    finished.end_time = Some(Utc::now());
    ctx.store.update_workflow_instance(&finished).await?;
    runnable.set_instance(finished.clone());
    info!(
        workflow_instance_id = runnable.id(),
        %from,
        to = %target,
        "workflow finished"
    );

    let alert = match target {
        WorkflowExecutionStatus::Success => finished.warning_type.alerts_on_success(),
        WorkflowExecutionStatus::Failed => finished.warning_type.alerts_on_failure(),
        _ => false,
    };
    if alert {
        let alerts = Arc::clone(&ctx.alerts);
        tokio::spawn(async move {
            if let Err(err) = alerts.send_workflow_result(&finished).await {
                warn!(workflow_instance_id = finished.id, error = %err, "failed to send result alert");
            }
        });
    }

    emit(runnable, WorkflowStateEvent::Finalize)
}

/// Unregister the runnable and close its repository. The only way a
/// runnable is destroyed.
pub(crate) fn finalize(ctx: &EngineContext, runnable: &WorkflowExecutionRunnable) {
    ctx.runnables.remove(runnable.id());
    runnable.repository().close();
    info!(workflow_instance_id = runnable.id(), state = %runnable.state(), "workflow finalized");
    start_next_serial(ctx, runnable.definition().code);
}

/// Release the oldest instance of the same definition waiting in
/// `SerialWait`.
fn start_next_serial(ctx: &EngineContext, definition_code: i64) {
    let next = ctx
        .runnables
        .snapshot()
        .into_iter()
        .filter(|candidate| {
            candidate.definition().code == definition_code
                && candidate.state() == WorkflowExecutionStatus::SerialWait
        })
        .min_by_key(|candidate| candidate.id());
    if let Some(next) = next {
        if emit(&next, WorkflowStateEvent::Start).is_ok() {
            info!(workflow_instance_id = next.id(), "released serial workflow");
            ctx.wakeup.notify_one();
        }
    }
}

// ---------------------------------------------------------------------------
// Task status reports
// ---------------------------------------------------------------------------

/// Apply a worker's status report to the task attempt it names.
///
/// With `allow_retry`, a failure with retries left (or a task lost with its
/// worker) starts a new attempt. The old row is persisted before anything
/// changes in memory, so a failed call can simply be replayed.
pub(crate) async fn apply_task_state_change(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    task_instance_id: i64,
    status: TaskExecutionStatus,
    host: Option<String>,
    allow_retry: bool,
) -> Result<TaskChange, EngineError> {
    let current = {
        let graph = runnable.graph();
        graph.find_by_instance_id(task_instance_id).and_then(|code| {
            let task = graph.task(code);
            task.instance()
                .cloned()
                .map(|row| (code, row, task.definition().max_retry_times))
        })
    };
    let Some((code, mut row, max_retry_times)) = current else {
        warn!(
            workflow_instance_id = runnable.id(),
            task_instance_id,
            %status,
            "report for an unknown or superseded task attempt, ignoring"
        );
        return Ok(TaskChange::Ignored);
    };

    if row.status.is_finished() {
        return settle_late_report(ctx, runnable, code, row, status, host).await;
    }

    if let Some(host) = host {
        row.host = Some(host);
    }
    row.status = status;
    let now = Utc::now();
    if status == TaskExecutionStatus::Running && row.start_time.is_none() {
        row.start_time = Some(now);
    }
    if status.is_finished() {
        row.end_time = Some(now);
    }

    let retry_times = match status {
        TaskExecutionStatus::NeedFaultTolerance if allow_retry => Some(row.retry_times),
        TaskExecutionStatus::Failure if allow_retry && row.retry_times < max_retry_times => {
            Some(row.retry_times + 1)
        }
        _ => None,
    };
    if retry_times.is_some() || status == TaskExecutionStatus::NeedFaultTolerance {
        row.alive = false;
    }

    ctx.store.upsert_task_instance(&row).await?;
    debug!(
        workflow_instance_id = runnable.id(),
        task_code = code,
        task_instance_id,
        %status,
        "task status applied"
    );

    if let Some(retry_times) = retry_times {
        info!(
            workflow_instance_id = runnable.id(),
            task_code = code,
            task_instance_id,
            %status,
            retry_times,
            "starting a new task attempt"
        );
        start_task(ctx, runnable, code, retry_times).await?;
        return Ok(TaskChange::Retrying);
    }

    runnable.graph().record_instance(code, row);
    if status.is_finished() {
        Ok(TaskChange::Finished(code))
    } else {
        Ok(TaskChange::Progressed)
    }
}

/// A report for an attempt that already finished. The only one acted on is
/// a dispatch acknowledgement for a task that was killed or paused before
/// its worker was known: the worker is told to kill it.
async fn settle_late_report(
    ctx: &EngineContext,
    runnable: &WorkflowExecutionRunnable,
    code: i64,
    mut row: TaskInstance,
    status: TaskExecutionStatus,
    host: Option<String>,
) -> Result<TaskChange, EngineError> {
    let orphan_host = match (status, host) {
        (TaskExecutionStatus::Dispatch, Some(host)) if row.host.is_none() => host,
        _ => {
            debug!(
                workflow_instance_id = runnable.id(),
                task_instance_id = row.id,
                %status,
                finished = %row.status,
                "task already finished, ignoring report"
            );
            return Ok(TaskChange::Ignored);
        }
    };
    row.host = Some(orphan_host);
    ctx.store.upsert_task_instance(&row).await?;
    let task_instance_id = row.id;
    runnable.graph().record_instance(code, row);
    emit_task_operation(runnable, code, task_instance_id, TaskOperationKind::Kill)?;
    Ok(TaskChange::Ignored)
}
