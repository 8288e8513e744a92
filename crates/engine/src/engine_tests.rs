//! End-to-end tests for the scheduler core.
//!
//! The engine is driven by hand: `settle` ticks it and waits until every
//! queue is drained, so each test observes a quiescent system between steps.
//! Workers are simulated by `MockTaskExecutor`; completions are reported back
//! through the coordinator the way a worker callback would.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use db::models::{
    Command, CommandType, ConditionBranches, ExecutionMode, FailureStrategy, TaskExecutionStatus,
    WarningType, WorkflowDefinition, WorkflowExecutionStatus,
};
use db::{DbError, MemoryStore, WorkflowStore};
use nodes::mock::{MockBehaviour, MockTaskExecutor};
use parking_lot::Mutex;
use registry::{master_failover_lock_path, MemoryRegistry, NodeType, RegistryClient};

use crate::alert::{MemoryAlertSender, SentAlert};
use crate::config::MasterConfig;
use crate::context::EngineContext;
use crate::coordinator::{TaskEventReport, WorkflowCoordinator};
use crate::error::{EngineError, GraphError};
use crate::event::{OperationKind, WorkflowEvent, WorkflowStateEvent};
use crate::event_engine::EventEngine;
use crate::failover::FailoverService;
use crate::graph::ExecutionGraph;
use crate::runnable::WorkflowExecutionRunnable;
use crate::state::common::terminal_event;
use crate::state::{StateActionTable, WorkflowStateAction};
use crate::testing::{definition, instance_of, task_def, workflow_instance};
use crate::timeout::TimeoutChecker;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

const MASTER: &str = "master-1";
const WORKER: &str = "worker-1";

struct Harness {
    store: Arc<MemoryStore>,
    executor: Arc<MockTaskExecutor>,
    alerts: Arc<MemoryAlertSender>,
    ctx: EngineContext,
    coordinator: Arc<WorkflowCoordinator>,
    engine: EventEngine,
}

impl Harness {
    fn new() -> Self {
        Self::with_actions(StateActionTable::standard().unwrap())
    }

    fn with_actions(actions: StateActionTable) -> Self {
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(MockTaskExecutor::accepting(WORKER));
        let alerts = Arc::new(MemoryAlertSender::new());
        let config = MasterConfig {
            // Longer than one `settle` window, so a rejected dispatch does not
            // keep the engine busy forever.
            dispatch_retry_interval: Duration::from_millis(40),
            ..MasterConfig::with_host(MASTER)
        };
        let ctx = EngineContext::new(
            Arc::clone(&store) as Arc<dyn WorkflowStore>,
            Arc::clone(&executor) as Arc<dyn nodes::TaskExecutorClient>,
            Arc::clone(&alerts) as Arc<dyn crate::alert::AlertSender>,
            config,
        );
        let coordinator = Arc::new(WorkflowCoordinator::new(ctx.clone()));
        let engine = EventEngine::new(ctx.clone(), Arc::new(actions));
        Self {
            store,
            executor,
            alerts,
            ctx,
            coordinator,
            engine,
        }
    }

    /// Tick until no drain starts for a few rounds in a row.
    async fn settle(&self) {
        let mut idle_rounds = 0;
        for _ in 0..500 {
            let drains = self.engine.tick();
            let busy = !drains.is_empty();
            for drain in drains {
                drain.await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
            if busy {
                idle_rounds = 0;
            } else {
                idle_rounds += 1;
                if idle_rounds >= 5 {
                    return;
                }
            }
        }
        panic!("engine did not settle");
    }

    async fn start(&self, definition: &WorkflowDefinition) -> i64 {
        self.start_with(definition, Command::default()).await
    }

    async fn start_with(&self, definition: &WorkflowDefinition, command: Command) -> i64 {
        self.coordinator.register_definition(definition).await.unwrap();
        let id = self
            .coordinator
            .submit(Command {
                command_type: CommandType::Start,
                definition_code: definition.code,
                definition_version: definition.version,
                ..command
            })
            .await
            .unwrap();
        self.settle().await;
        id
    }

    /// Latest dispatched attempt of `task_code`.
    fn attempt(&self, workflow_instance_id: i64, task_code: i64) -> i64 {
        self.executor
            .dispatched()
            .into_iter()
            .rev()
            .find(|r| r.workflow_instance_id == workflow_instance_id && r.task_code == task_code)
            .map(|r| r.task_instance_id)
            .unwrap_or_else(|| panic!("task {task_code} was never dispatched"))
    }

    async fn report(&self, workflow_instance_id: i64, task_code: i64, status: TaskExecutionStatus) {
        let task_instance_id = self.attempt(workflow_instance_id, task_code);
        self.coordinator
            .report_task_event(TaskEventReport {
                workflow_instance_id,
                task_instance_id,
                status,
                host: None,
            })
            .unwrap();
        self.settle().await;
    }

    async fn state(&self, workflow_instance_id: i64) -> WorkflowExecutionStatus {
        self.store
            .load_workflow_instance(workflow_instance_id)
            .await
            .unwrap()
            .state
    }

    fn sorted_dispatched_codes(&self) -> Vec<i64> {
        let mut codes = self.executor.dispatched_codes();
        codes.sort_unstable();
        codes
    }
}

fn chain(codes: &[i64]) -> WorkflowDefinition {
    let edges: Vec<(i64, i64)> = codes.windows(2).map(|w| (w[0], w[1])).collect();
    definition(codes.iter().copied().map(task_def).collect(), &edges)
}

// ---------------------------------------------------------------------------
// Happy paths and graph walking
// ---------------------------------------------------------------------------

#[tokio::test]
async fn linear_workflow_runs_to_success_and_finalizes() {
    let h = Harness::new();
    let id = h.start(&chain(&[1, 2, 3])).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Running);
    assert_eq!(h.executor.dispatched_codes(), vec![1]);

    h.report(id, 1, TaskExecutionStatus::Success).await;
    assert_eq!(h.executor.dispatched_codes(), vec![1, 2]);
    h.report(id, 2, TaskExecutionStatus::Success).await;
    h.report(id, 3, TaskExecutionStatus::Success).await;

    let instance = h.store.load_workflow_instance(id).await.unwrap();
    assert_eq!(instance.state, WorkflowExecutionStatus::Success);
    assert!(instance.end_time.is_some());
    assert!(!h.ctx.runnables.contains(id), "finalize removes the runnable");

    let tasks = h.store.list_task_instances(id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.status == TaskExecutionStatus::Success));
    assert!(tasks.iter().all(|t| t.host.as_deref() == Some(WORKER)));
}

#[tokio::test]
async fn empty_workflow_succeeds_immediately() {
    let h = Harness::new();
    let id = h.start(&definition(Vec::new(), &[])).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn forbidden_tasks_are_passed_over_without_dispatch() {
    let h = Harness::new();
    let tasks = [1, 2, 3, 4, 5, 6, 8]
        .into_iter()
        .map(|code| {
            let mut task = task_def(code);
            task.forbidden = code == 2;
            task
        })
        .collect();
    let def = definition(
        tasks,
        &[(1, 2), (2, 3), (4, 3), (3, 5), (3, 6), (2, 8), (8, 5)],
    );
    let id = h.start(&def).await;
    assert_eq!(h.sorted_dispatched_codes(), vec![1, 4]);

    h.report(id, 1, TaskExecutionStatus::Success).await;
    assert_eq!(h.sorted_dispatched_codes(), vec![1, 4, 8]);

    h.report(id, 4, TaskExecutionStatus::Success).await;
    assert_eq!(h.sorted_dispatched_codes(), vec![1, 3, 4, 8]);

    h.report(id, 8, TaskExecutionStatus::Success).await;
    h.report(id, 3, TaskExecutionStatus::Success).await;
    h.report(id, 5, TaskExecutionStatus::Success).await;
    h.report(id, 6, TaskExecutionStatus::Success).await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
    assert!(!h.executor.dispatched_codes().contains(&2));
}

#[tokio::test]
async fn conditional_task_runs_only_the_chosen_branch() {
    let h = Harness::new();
    let mut cond = task_def(1);
    cond.condition = Some(ConditionBranches {
        success_nodes: vec![5],
        failed_nodes: vec![6],
    });
    let def = definition(
        vec![cond, task_def(5), task_def(6), task_def(7)],
        &[(1, 5), (1, 6), (5, 7), (6, 7)],
    );
    let id = h.start(&def).await;

    h.report(id, 1, TaskExecutionStatus::Success).await;
    assert_eq!(h.executor.dispatched_codes(), vec![1, 5]);

    h.report(id, 5, TaskExecutionStatus::Success).await;
    assert_eq!(h.executor.dispatched_codes(), vec![1, 5, 7], "the join still runs");

    h.report(id, 7, TaskExecutionStatus::Success).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn skip_propagates_through_nodes_fed_only_by_skipped_predecessors() {
    let h = Harness::new();
    let mut cond = task_def(1);
    cond.condition = Some(ConditionBranches {
        success_nodes: vec![2],
        failed_nodes: vec![3],
    });
    let def = definition(
        vec![cond, task_def(2), task_def(3), task_def(4)],
        &[(1, 2), (1, 3), (3, 4)],
    );
    let id = h.start(&def).await;

    h.report(id, 1, TaskExecutionStatus::Success).await;
    h.report(id, 2, TaskExecutionStatus::Success).await;

    assert_eq!(h.executor.dispatched_codes(), vec![1, 2]);
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn start_nodes_restrict_the_run_to_their_downstream() {
    let h = Harness::new();
    let def = chain(&[1, 2, 3]);
    let id = h
        .start_with(
            &def,
            Command {
                start_nodes: vec![2],
                ..Command::default()
            },
        )
        .await;
    assert_eq!(h.executor.dispatched_codes(), vec![2]);
    h.report(id, 2, TaskExecutionStatus::Success).await;
    h.report(id, 3, TaskExecutionStatus::Success).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

// ---------------------------------------------------------------------------
// Failures and retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_task_with_retries_left_gets_a_new_attempt() {
    let h = Harness::new();
    let mut task = task_def(1);
    task.max_retry_times = 1;
    task.retry_interval_secs = 7;
    let id = h.start(&definition(vec![task], &[])).await;
    let first = h.attempt(id, 1);

    h.report(id, 1, TaskExecutionStatus::Failure).await;
    let retry = h.executor.dispatched().pop().unwrap();
    assert_ne!(retry.task_instance_id, first);
    assert_eq!((retry.retry_times, retry.delay_secs), (1, 7));
    assert!(!h.store.load_task_instance(first).await.unwrap().alive);

    h.report(id, 1, TaskExecutionStatus::Success).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn exhausted_failure_fails_the_workflow_and_alerts() {
    let h = Harness::new();
    let def = definition(vec![task_def(1), task_def(2), task_def(3)], &[(1, 3)]);
    let id = h
        .start_with(
            &def,
            Command {
                warning_type: WarningType::Failure,
                ..Command::default()
            },
        )
        .await;

    h.report(id, 1, TaskExecutionStatus::Failure).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Running, "task 2 still runs");

    h.report(id, 2, TaskExecutionStatus::Success).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Failed);
    assert!(!h.executor.dispatched_codes().contains(&3));
    assert_eq!(
        h.alerts.sent(),
        vec![SentAlert::Result {
            workflow_instance_id: id,
            state: WorkflowExecutionStatus::Failed
        }]
    );
}

#[tokio::test]
async fn failure_strategy_end_kills_the_remaining_tasks() {
    let h = Harness::new();
    let def = definition(vec![task_def(1), task_def(2)], &[]);
    let id = h
        .start_with(
            &def,
            Command {
                failure_strategy: FailureStrategy::End,
                ..Command::default()
            },
        )
        .await;
    let second = h.attempt(id, 2);

    h.report(id, 1, TaskExecutionStatus::Failure).await;
    assert_eq!(h.executor.killed(), vec![second]);

    h.report(id, 2, TaskExecutionStatus::Killed).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Failed);
}

#[tokio::test]
async fn fatal_dispatch_error_fails_the_task() {
    let h = Harness::new();
    h.executor
        .set_behaviour(MockBehaviour::FailFatal("unknown task type".into()));
    let id = h.start(&chain(&[1])).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Failed);
}

#[tokio::test]
async fn retryable_dispatch_error_is_retried_until_a_worker_accepts() {
    let h = Harness::new();
    h.executor
        .set_behaviour(MockBehaviour::FailRetryable("no worker group".into()));
    let id = h.start(&chain(&[1])).await;
    assert!(h.executor.call_count() >= 1);

    h.executor.set_behaviour(MockBehaviour::Accept(WORKER.into()));
    // The dispatcher keeps re-queueing the dispatch in the background.
    for _ in 0..50 {
        h.settle().await;
        let task = h.store.list_task_instances(id).await.unwrap().remove(0);
        if task.status == TaskExecutionStatus::Dispatch {
            return;
        }
    }
    panic!("task was never dispatched once workers accepted it");
}

// ---------------------------------------------------------------------------
// Pause, stop, resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pause_waits_for_running_tasks_then_resume_reruns_them() {
    let h = Harness::new();
    let id = h.start(&chain(&[1, 2])).await;
    let first = h.attempt(id, 1);

    h.coordinator.operate(id, OperationKind::Pause).unwrap();
    h.settle().await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::ReadyPause);
    assert_eq!(h.executor.paused(), vec![first]);

    h.report(id, 1, TaskExecutionStatus::Paused).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Paused);
    assert!(!h.ctx.runnables.contains(id));

    h.coordinator
        .submit(Command {
            command_type: CommandType::Resume,
            workflow_instance_id: Some(id),
            ..Command::default()
        })
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.executor.dispatched_codes(), vec![1, 1]);

    h.report(id, 1, TaskExecutionStatus::Success).await;
    h.report(id, 2, TaskExecutionStatus::Success).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn workflow_finishing_while_pausing_ends_as_success() {
    let h = Harness::new();
    let id = h.start(&chain(&[1])).await;

    h.coordinator.operate(id, OperationKind::Pause).unwrap();
    h.settle().await;
    h.report(id, 1, TaskExecutionStatus::Success).await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn succeed_before_paused_in_ready_pause_persists_success() {
    let h = Harness::new();
    let id = h.start(&chain(&[1])).await;
    h.coordinator.operate(id, OperationKind::Pause).unwrap();
    h.settle().await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::ReadyPause);

    let dispatcher = h.coordinator.dispatcher();
    dispatcher
        .dispatch(WorkflowEvent::state(id, WorkflowStateEvent::Succeed))
        .unwrap();
    dispatcher
        .dispatch(WorkflowEvent::state(id, WorkflowStateEvent::Paused))
        .unwrap();
    h.settle().await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn stop_kills_running_tasks_and_ends_stopped() {
    let h = Harness::new();
    let def = definition(vec![task_def(1), task_def(2)], &[]);
    let id = h.start(&def).await;
    let mut attempts = vec![h.attempt(id, 1), h.attempt(id, 2)];
    attempts.sort_unstable();

    h.coordinator.operate(id, OperationKind::Kill).unwrap();
    h.settle().await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::ReadyStop);
    let mut killed = h.executor.killed();
    killed.sort_unstable();
    assert_eq!(killed, attempts);

    h.report(id, 1, TaskExecutionStatus::Killed).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::ReadyStop);
    h.report(id, 2, TaskExecutionStatus::Killed).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Stopped);
}

#[tokio::test]
async fn stop_settles_tasks_that_never_reached_a_worker() {
    let h = Harness::new();
    h.executor
        .set_behaviour(MockBehaviour::FailRetryable("no worker group".into()));
    let id = h.start(&chain(&[1])).await;

    h.coordinator.operate(id, OperationKind::Kill).unwrap();
    h.settle().await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Stopped);
    let task = h.store.list_task_instances(id).await.unwrap().remove(0);
    assert_eq!(task.status, TaskExecutionStatus::Killed);
    assert!(h.executor.killed().is_empty());
}

#[tokio::test]
async fn failed_workflow_can_be_recovered() {
    let h = Harness::new();
    let id = h.start(&chain(&[1, 2])).await;
    h.report(id, 1, TaskExecutionStatus::Failure).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Failed);

    h.coordinator
        .submit(Command {
            command_type: CommandType::RecoverFailed,
            workflow_instance_id: Some(id),
            ..Command::default()
        })
        .await
        .unwrap();
    h.settle().await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Running);

    h.report(id, 1, TaskExecutionStatus::Success).await;
    h.report(id, 2, TaskExecutionStatus::Success).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn resume_is_rejected_for_an_instance_that_is_not_paused() {
    let h = Harness::new();
    let id = h.start(&chain(&[1])).await;
    h.report(id, 1, TaskExecutionStatus::Success).await;

    let err = h
        .coordinator
        .submit(Command {
            command_type: CommandType::Resume,
            workflow_instance_id: Some(id),
            ..Command::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidCommand(_)));
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_graphs_are_rejected_before_anything_is_persisted() {
    let h = Harness::new();
    let mut cyclic = chain(&[1, 2]);
    cyclic.edges.push(db::models::Edge { pre: 2, post: 1 });
    let err = h.coordinator.register_definition(&cyclic).await.unwrap_err();
    assert!(matches!(err, EngineError::Graph(GraphError::CycleDetected)));

    let def = chain(&[1, 2]);
    h.coordinator.register_definition(&def).await.unwrap();
    let err = h
        .coordinator
        .submit(Command {
            definition_code: def.code,
            definition_version: def.version,
            start_nodes: vec![9],
            ..Command::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Graph(GraphError::UnknownStartNode(9))));
    assert!(h.store.workflow_instances().is_empty());
}

#[tokio::test]
async fn serial_instances_of_one_workflow_run_one_after_another() {
    let h = Harness::new();
    let def = chain(&[1]);
    let serial = Command {
        execution_mode: ExecutionMode::Serial,
        ..Command::default()
    };
    let first = h.start_with(&def, serial.clone()).await;
    let second = h.start_with(&def, serial).await;

    assert_eq!(h.state(first).await, WorkflowExecutionStatus::Running);
    assert_eq!(h.state(second).await, WorkflowExecutionStatus::SerialWait);
    assert_eq!(h.executor.dispatched_codes(), vec![1]);

    h.report(first, 1, TaskExecutionStatus::Success).await;
    assert_eq!(h.state(second).await, WorkflowExecutionStatus::Running);
    assert_eq!(h.executor.dispatched_codes(), vec![1, 1]);
}

#[tokio::test]
async fn events_for_unknown_instances_are_rejected() {
    let h = Harness::new();
    let err = h.coordinator.operate(404, OperationKind::Pause).unwrap_err();
    assert!(matches!(err, EngineError::RunnableNotFound(404)));
}

#[tokio::test]
async fn undefined_event_is_dropped_without_state_change() {
    let h = Harness::new();
    let id = h.start(&chain(&[1])).await;
    h.coordinator
        .dispatcher()
        .dispatch(WorkflowEvent::state(id, WorkflowStateEvent::Finalize))
        .unwrap();
    h.settle().await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Running);
    assert!(h.ctx.runnables.contains(id));
}

#[tokio::test]
async fn stale_task_reports_are_ignored() {
    let h = Harness::new();
    let id = h.start(&chain(&[1, 2])).await;
    h.report(id, 1, TaskExecutionStatus::Success).await;
    // Duplicate report for an attempt that already finished.
    h.report(id, 1, TaskExecutionStatus::Failure).await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Running);
    assert_eq!(h.executor.dispatched_codes(), vec![1, 2]);
}

// ---------------------------------------------------------------------------
// Transient failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_store_failure_requeues_the_event() {
    let h = Harness::new();
    let id = h.start(&chain(&[1, 2])).await;

    h.store.fail_next_calls(1);
    h.report(id, 1, TaskExecutionStatus::Success).await;

    assert_eq!(
        h.store.load_task_instance(h.attempt(id, 1)).await.unwrap().status,
        TaskExecutionStatus::Success
    );
    assert_eq!(h.executor.dispatched_codes(), vec![1, 2]);
}

#[tokio::test]
async fn failed_finish_persist_leaves_memory_untouched_until_retried() {
    let h = Harness::new();
    let id = h.start(&chain(&[1])).await;

    h.store.set_available(false);
    h.coordinator
        .report_task_event(TaskEventReport {
            workflow_instance_id: id,
            task_instance_id: h.attempt(id, 1),
            status: TaskExecutionStatus::Success,
            host: None,
        })
        .unwrap();
    for _ in 0..3 {
        for drain in h.engine.tick() {
            assert!(drain.await.unwrap().requeued);
        }
    }
    let runnable = h.ctx.runnables.get(id).unwrap();
    assert_eq!(runnable.state(), WorkflowExecutionStatus::Running);

    h.store.set_available(true);
    h.settle().await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn start_is_retried_when_creating_the_first_task_fails() {
    let h = Harness::new();
    h.store.fail_next_calls_to("upsert_task_instance", 1);
    let id = h.start(&chain(&[1, 2])).await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Running);
    assert_eq!(h.executor.dispatched_codes(), vec![1]);
    assert_eq!(h.store.list_task_instances(id).await.unwrap().len(), 1);

    h.report(id, 1, TaskExecutionStatus::Success).await;
    h.report(id, 2, TaskExecutionStatus::Success).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Success);
}

#[tokio::test]
async fn pause_is_retried_when_settling_an_undispatched_task_fails() {
    let h = Harness::new();
    h.executor
        .set_behaviour(MockBehaviour::FailRetryable("no worker group".into()));
    let id = h.start(&chain(&[1])).await;

    h.store.fail_next_calls_to("upsert_task_instance", 1);
    h.coordinator.operate(id, OperationKind::Pause).unwrap();
    h.settle().await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Paused);
    let task = h.store.list_task_instances(id).await.unwrap().remove(0);
    assert_eq!(task.status, TaskExecutionStatus::Paused);
    assert!(!h.ctx.runnables.contains(id));
}

#[tokio::test]
async fn stop_is_retried_when_settling_an_undispatched_task_fails() {
    let h = Harness::new();
    h.executor
        .set_behaviour(MockBehaviour::FailRetryable("no worker group".into()));
    let id = h.start(&chain(&[1])).await;

    h.store.fail_next_calls_to("upsert_task_instance", 1);
    h.coordinator.operate(id, OperationKind::Kill).unwrap();
    h.settle().await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Stopped);
    let task = h.store.list_task_instances(id).await.unwrap().remove(0);
    assert_eq!(task.status, TaskExecutionStatus::Killed);
}

#[tokio::test]
async fn new_instances_are_launched_without_reading_task_rows() {
    let h = Harness::new();
    h.store.fail_next_calls_to("list_task_instances", 1);
    let id = h.start(&chain(&[1])).await;

    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Running);
    assert_eq!(h.executor.dispatched_codes(), vec![1]);
}

#[tokio::test]
async fn failed_resume_leaves_the_instance_paused_and_resumable() {
    let h = Harness::new();
    let id = h.start(&chain(&[1])).await;
    h.coordinator.operate(id, OperationKind::Pause).unwrap();
    h.settle().await;
    h.report(id, 1, TaskExecutionStatus::Paused).await;
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Paused);

    let resume = Command {
        command_type: CommandType::Resume,
        workflow_instance_id: Some(id),
        ..Command::default()
    };
    h.store.fail_next_calls_to("list_task_instances", 1);
    let err = h.coordinator.submit(resume.clone()).await.unwrap_err();
    assert!(err.is_transient());
    let row = h.store.load_workflow_instance(id).await.unwrap();
    assert_eq!(row.state, WorkflowExecutionStatus::Paused);
    assert_eq!(row.command_type, CommandType::Start);
    assert!(!h.ctx.runnables.contains(id));

    h.coordinator.submit(resume).await.unwrap();
    h.settle().await;
    assert_eq!(h.executor.dispatched_codes(), vec![1, 1]);
}

// ---------------------------------------------------------------------------
// Terminal priority
// ---------------------------------------------------------------------------

fn finished_graph(outcomes: &[(i64, TaskExecutionStatus)]) -> ExecutionGraph {
    let def = definition(outcomes.iter().map(|&(code, _)| task_def(code)).collect(), &[]);
    let mut graph = ExecutionGraph::new(&def, &[]).unwrap();
    for &(code, status) in outcomes {
        graph.mark_active(code);
        graph.record_instance(code, instance_of(code, code, status));
    }
    graph
}

#[test]
fn failure_outranks_pause_and_success() {
    let graph = finished_graph(&[
        (1, TaskExecutionStatus::Failure),
        (2, TaskExecutionStatus::Paused),
        (3, TaskExecutionStatus::Success),
    ]);
    assert!(graph.is_all_chain_finished());
    assert_eq!(terminal_event(&graph), WorkflowStateEvent::Failed);
}

#[test]
fn kill_outranks_pause() {
    let graph = finished_graph(&[
        (1, TaskExecutionStatus::Killed),
        (2, TaskExecutionStatus::Paused),
    ]);
    assert_eq!(terminal_event(&graph), WorkflowStateEvent::Stopped);

    let graph = finished_graph(&[
        (1, TaskExecutionStatus::Success),
        (2, TaskExecutionStatus::Paused),
    ]);
    assert_eq!(terminal_event(&graph), WorkflowStateEvent::Paused);
}

// ---------------------------------------------------------------------------
// Ordering guarantees
// ---------------------------------------------------------------------------

/// Records every event it sees, tracks how many handlers run at once and
/// fails one chosen event once with a transient error.
struct RecordingAction {
    state: WorkflowExecutionStatus,
    seen: Arc<Mutex<Vec<i64>>>,
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
    fail_once: Arc<Mutex<Option<i64>>>,
}

#[async_trait]
impl WorkflowStateAction for RecordingAction {
    fn state(&self) -> WorkflowExecutionStatus {
        self.state
    }

    async fn handle(
        &self,
        _ctx: &EngineContext,
        _runnable: &Arc<WorkflowExecutionRunnable>,
        event: WorkflowStateEvent,
    ) -> Result<(), EngineError> {
        let WorkflowStateEvent::TaskStateChange {
            task_instance_id, ..
        } = event
        else {
            return Ok(());
        };
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_micros(200)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.seen.lock().push(task_instance_id);
        let fail = {
            let mut fail_once = self.fail_once.lock();
            if *fail_once == Some(task_instance_id) {
                *fail_once = None;
                true
            } else {
                false
            }
        };
        if fail {
            return Err(EngineError::Database(DbError::Unavailable("injected".into())));
        }
        Ok(())
    }
}

struct Recorder {
    seen: Arc<Mutex<Vec<i64>>>,
    max_active: Arc<AtomicUsize>,
    fail_once: Arc<Mutex<Option<i64>>>,
}

fn recording_harness() -> (Harness, Recorder) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));
    let fail_once = Arc::new(Mutex::new(None));
    let actions = WorkflowExecutionStatus::ALL
        .into_iter()
        .map(|state| {
            Arc::new(RecordingAction {
                state,
                seen: Arc::clone(&seen),
                active: Arc::clone(&active),
                max_active: Arc::clone(&max_active),
                fail_once: Arc::clone(&fail_once),
            }) as Arc<dyn WorkflowStateAction>
        })
        .collect();
    let harness = Harness::with_actions(StateActionTable::new(actions).unwrap());
    (
        harness,
        Recorder {
            seen,
            max_active,
            fail_once,
        },
    )
}

fn live_runnable(h: &Harness, id: i64) -> Arc<WorkflowExecutionRunnable> {
    let def = chain(&[1]);
    let graph = ExecutionGraph::new(&def, &[]).unwrap();
    let runnable = Arc::new(WorkflowExecutionRunnable::new(
        workflow_instance(id, WorkflowExecutionStatus::Running),
        def,
        graph,
    ));
    assert!(h.ctx.runnables.insert(Arc::clone(&runnable)));
    runnable
}

fn numbered_event(id: i64, seq: i64) -> WorkflowEvent {
    WorkflowEvent::task_state_change(id, seq, TaskExecutionStatus::Running, None)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn events_of_one_instance_are_handled_in_enqueue_order() {
    let (h, recorder) = recording_harness();
    let runnable = live_runnable(&h, 1);

    let producers: Vec<_> = (0..4i64)
        .map(|producer| {
            let runnable = Arc::clone(&runnable);
            tokio::spawn(async move {
                for seq in 0..25 {
                    runnable
                        .repository()
                        .push_tail(numbered_event(1, producer * 1000 + seq))
                        .unwrap();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    let ticking = async {
        for _ in 0..50 {
            for drain in h.engine.tick() {
                drain.await.unwrap();
            }
            tokio::task::yield_now().await;
        }
    };
    tokio::join!(join_all(producers), ticking);
    h.settle().await;

    let seen = recorder.seen.lock().clone();
    assert_eq!(seen.len(), 100);
    for producer in 0..4i64 {
        let order: Vec<i64> = seen
            .iter()
            .copied()
            .filter(|id| id / 1000 == producer)
            .collect();
        let expected: Vec<i64> = (0..25).map(|seq| producer * 1000 + seq).collect();
        assert_eq!(order, expected, "producer {producer} reordered");
    }
}

async fn join_all(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn requeued_event_is_retried_before_later_events() {
    let (h, recorder) = recording_harness();
    let runnable = live_runnable(&h, 1);
    *recorder.fail_once.lock() = Some(2);
    for seq in 1..=4 {
        runnable.repository().push_tail(numbered_event(1, seq)).unwrap();
    }

    h.settle().await;
    assert_eq!(*recorder.seen.lock(), vec![1, 2, 2, 3, 4]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ticks_never_drain_one_instance_twice() {
    let (h, recorder) = recording_harness();
    let h = Arc::new(h);
    let runnable = live_runnable(&h, 1);
    for seq in 0..200 {
        runnable.repository().push_tail(numbered_event(1, seq)).unwrap();
    }

    let tickers: Vec<_> = (0..8)
        .map(|_| {
            let h = Arc::clone(&h);
            tokio::spawn(async move {
                for _ in 0..20 {
                    for drain in h.engine.tick() {
                        drain.await.unwrap();
                    }
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();
    join_all(tickers).await;
    h.settle().await;

    assert_eq!(recorder.seen.lock().len(), 200);
    assert_eq!(recorder.max_active.load(Ordering::SeqCst), 1);
    assert!(!h.engine.is_firing(1));
}

// ---------------------------------------------------------------------------
// Failover
// ---------------------------------------------------------------------------

fn failover_service(h: &Harness, registry: &MemoryRegistry) -> FailoverService {
    FailoverService::new(
        h.ctx.clone(),
        Arc::clone(&h.coordinator),
        Arc::new(registry.clone()) as Arc<dyn RegistryClient>,
    )
}

/// An instance left `Running` by `dead-master` with task 1 dispatched.
async fn orphaned_instance(h: &Harness) -> i64 {
    let def = chain(&[1, 2]);
    h.store.save_workflow_definition(&def).await.unwrap();
    let mut instance = workflow_instance(0, WorkflowExecutionStatus::Running);
    instance.host = Some("dead-master".into());
    instance.start_time = Utc::now() - chrono::Duration::minutes(5);
    let id = h.store.create_workflow_instance(&instance).await.unwrap();

    let mut task = instance_of(0, 1, TaskExecutionStatus::Dispatch);
    task.workflow_instance_id = id;
    h.store.upsert_task_instance(&task).await.unwrap();
    id
}

#[tokio::test]
async fn master_failover_adopts_each_orphaned_instance_once() {
    let h = Harness::new();
    let registry = MemoryRegistry::new(MASTER);
    registry.register_server(MASTER, NodeType::Master, Utc::now());
    let id = orphaned_instance(&h).await;
    let failover = failover_service(&h, &registry);

    assert_eq!(failover.failover_masters().await.unwrap(), 1);
    h.settle().await;
    assert_eq!(failover.failover_masters().await.unwrap(), 0);

    let instance = h.store.load_workflow_instance(id).await.unwrap();
    assert_eq!(instance.host.as_deref(), Some(MASTER));
    assert_eq!(instance.state, WorkflowExecutionStatus::Running);
    assert!(instance.restart_time.is_some());
    assert!(registry
        .lock_holder(&master_failover_lock_path("dead-master"))
        .is_none());

    // The restored attempt is still in flight; its completion moves on.
    assert!(h.executor.dispatched_codes().is_empty());
    let task_instance_id = h.store.list_task_instances(id).await.unwrap()[0].id;
    h.coordinator
        .report_task_event(TaskEventReport {
            workflow_instance_id: id,
            task_instance_id,
            status: TaskExecutionStatus::Success,
            host: None,
        })
        .unwrap();
    h.settle().await;
    assert_eq!(h.executor.dispatched_codes(), vec![2]);
}

#[tokio::test]
async fn failed_adoption_leaves_the_instance_for_the_next_pass() {
    let h = Harness::new();
    let registry = MemoryRegistry::new(MASTER);
    registry.register_server(MASTER, NodeType::Master, Utc::now());
    let id = orphaned_instance(&h).await;
    let failover = failover_service(&h, &registry);

    h.store.fail_next_calls_to("list_task_instances", 1);
    assert!(failover.failover_masters().await.unwrap_err().is_transient());
    let row = h.store.load_workflow_instance(id).await.unwrap();
    assert_eq!(row.host.as_deref(), Some("dead-master"));
    assert_eq!(row.state, WorkflowExecutionStatus::Running);
    assert!(row.restart_time.is_none());

    assert_eq!(failover.failover_masters().await.unwrap(), 1);
    assert!(h.ctx.runnables.contains(id));
}

#[tokio::test]
async fn master_failover_skips_hosts_locked_by_another_master() {
    let h = Harness::new();
    let registry = MemoryRegistry::new(MASTER);
    orphaned_instance(&h).await;
    let other = registry.client("master-2");
    assert!(other
        .acquire_lock(&master_failover_lock_path("dead-master"))
        .await
        .unwrap());

    let failover = failover_service(&h, &registry);
    assert_eq!(failover.failover_masters().await.unwrap(), 0);
    assert!(h.ctx.runnables.is_empty());
}

#[tokio::test]
async fn master_failover_leaves_instances_of_live_masters_alone() {
    let h = Harness::new();
    let registry = MemoryRegistry::new(MASTER);
    registry.register_server("dead-master", NodeType::Master, Utc::now());
    orphaned_instance(&h).await;

    let failover = failover_service(&h, &registry);
    assert_eq!(failover.failover_masters().await.unwrap(), 0);
}

#[tokio::test]
async fn worker_failover_only_orphans_tasks_submitted_before_the_restart() {
    let h = Harness::new();
    let registry = MemoryRegistry::new(MASTER);
    // 1 runs alone; 2 waits for 3.
    let def = definition(vec![task_def(1), task_def(2), task_def(3)], &[(3, 2)]);
    let id = h.start(&def).await;
    let before_restart = h.attempt(id, 1);

    tokio::time::sleep(Duration::from_millis(5)).await;
    registry.register_server(WORKER, NodeType::Worker, Utc::now());
    tokio::time::sleep(Duration::from_millis(5)).await;
    h.report(id, 3, TaskExecutionStatus::Success).await;
    let after_restart = h.attempt(id, 2);

    let failover = failover_service(&h, &registry);
    assert_eq!(failover.failover_workers().await.unwrap(), 1);
    h.settle().await;

    let orphaned = h.store.load_task_instance(before_restart).await.unwrap();
    assert_eq!(orphaned.status, TaskExecutionStatus::NeedFaultTolerance);
    assert!(!orphaned.alive);
    assert_eq!(
        h.store.load_task_instance(after_restart).await.unwrap().status,
        TaskExecutionStatus::Dispatch
    );
    assert_eq!(h.executor.killed(), vec![before_restart]);

    // Fault tolerance re-runs the task without consuming a retry.
    let rerun = h.executor.dispatched().pop().unwrap();
    assert_eq!((rerun.task_code, rerun.retry_times), (1, 0));
    assert_ne!(rerun.task_instance_id, before_restart);
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

#[tokio::test]
async fn timeout_alerts_once_and_keeps_the_workflow_running() {
    let h = Harness::new();
    let mut def = chain(&[1]);
    def.timeout_minutes = Some(1);
    let id = h.start(&def).await;
    let checker = TimeoutChecker::new(h.ctx.clone(), h.coordinator.dispatcher().clone());

    assert_eq!(checker.check_at(Utc::now()), 0);
    let later = Utc::now() + chrono::Duration::minutes(2);
    assert_eq!(checker.check_at(later), 1);
    assert_eq!(checker.check_at(later), 0);
    h.settle().await;

    assert_eq!(
        h.alerts.sent(),
        vec![SentAlert::Timeout {
            workflow_instance_id: id
        }]
    );
    assert_eq!(h.state(id).await, WorkflowExecutionStatus::Running);
}
