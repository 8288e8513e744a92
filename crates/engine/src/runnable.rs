//! The in-memory representation of a running workflow instance and the
//! registry of every instance this master currently owns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use db::models::{WorkflowDefinition, WorkflowExecutionStatus, WorkflowInstance};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::graph::ExecutionGraph;
use crate::repository::EventRepository;

/// One workflow instance owned by this master: its persisted row, the
/// execution graph and the queue of events addressed to it.
///
/// State only changes through the state action of the current state, and
/// only the drainer that holds the instance's firing mark runs state
/// actions. The locks here guard against readers (API, timeout checker,
/// failover) rather than against concurrent writers.
pub struct WorkflowExecutionRunnable {
    id: i64,
    instance: RwLock<WorkflowInstance>,
    definition: WorkflowDefinition,
    graph: Mutex<ExecutionGraph>,
    repository: EventRepository,
    finishing: AtomicBool,
    timeout_alerted: AtomicBool,
}

impl WorkflowExecutionRunnable {
    pub fn new(
        instance: WorkflowInstance,
        definition: WorkflowDefinition,
        graph: ExecutionGraph,
    ) -> Self {
        Self {
            id: instance.id,
            repository: EventRepository::new(instance.id),
            instance: RwLock::new(instance),
            definition,
            graph: Mutex::new(graph),
            finishing: AtomicBool::new(false),
            timeout_alerted: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn state(&self) -> WorkflowExecutionStatus {
        self.instance.read().state
    }

    /// Snapshot of the instance row as last persisted.
    pub fn instance(&self) -> WorkflowInstance {
        self.instance.read().clone()
    }

    /// Replace the in-memory row. Callers persist first.
    pub(crate) fn set_instance(&self, instance: WorkflowInstance) {
        *self.instance.write() = instance;
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    /// Lock the execution graph. Never hold the guard across an `.await`.
    pub fn graph(&self) -> MutexGuard<'_, ExecutionGraph> {
        self.graph.lock()
    }

    pub fn repository(&self) -> &EventRepository {
        &self.repository
    }

    /// Claim the right to emit the terminal event. Only the first caller
    /// after a transition wins.
    pub(crate) fn begin_finishing(&self) -> bool {
        self.finishing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn reset_finishing(&self) {
        self.finishing.store(false, Ordering::SeqCst);
    }

    /// Claim the single timeout alert of this instance.
    pub(crate) fn claim_timeout_alert(&self) -> bool {
        !self.timeout_alerted.swap(true, Ordering::SeqCst)
    }
}

/// Every live runnable on this master, keyed by workflow instance id.
#[derive(Default)]
pub struct WorkflowRunnableRegistry {
    runnables: DashMap<i64, Arc<WorkflowExecutionRunnable>>,
}

impl WorkflowRunnableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a runnable. Returns `false` if one with the same id exists.
    pub fn insert(&self, runnable: Arc<WorkflowExecutionRunnable>) -> bool {
        match self.runnables.entry(runnable.id()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(runnable);
                true
            }
        }
    }

    pub fn remove(&self, id: i64) -> Option<Arc<WorkflowExecutionRunnable>> {
        self.runnables.remove(&id).map(|(_, runnable)| runnable)
    }

    pub fn get(&self, id: i64) -> Option<Arc<WorkflowExecutionRunnable>> {
        self.runnables.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, id: i64) -> bool {
        self.runnables.contains_key(&id)
    }

    /// Clone out every runnable so callers never hold a shard lock.
    pub fn snapshot(&self) -> Vec<Arc<WorkflowExecutionRunnable>> {
        self.runnables
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.runnables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runnables.is_empty()
    }
}
