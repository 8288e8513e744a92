//! Execution graph: the DAG of one workflow instance and the readiness rules
//! that decide which tasks may run next.
//!
//! Rules enforced at construction:
//! 1. Task codes must be unique within the definition.
//! 2. Every edge must reference known task codes (both `pre` and `post`).
//! 3. The directed graph must be acyclic (topological sort must succeed).
//!
//! At run time a predecessor is *resolved* when it succeeded, when it is a
//! finished conditional task, or when it was passed over as forbidden or
//! skipped. A node is skipped only when all of its predecessors were passed
//! over and at least one of them was skipped; forbidden predecessors alone
//! never skip their successors.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use db::models::{TaskExecutionStatus, TaskInstance, WorkflowDefinition};

use crate::error::GraphError;
use crate::task::{NodeFlow, TaskExecutionRunnable};

/// How a finished (or unfinished) node looks to its successors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Unresolved,
    /// Succeeded, or a conditional task that picked a branch.
    Ran,
    Forbidden,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    tasks: BTreeMap<i64, TaskExecutionRunnable>,
    predecessors: BTreeMap<i64, BTreeSet<i64>>,
    successors: BTreeMap<i64, BTreeSet<i64>>,
    start_nodes: Vec<i64>,
}

impl ExecutionGraph {
    /// Build the graph of `definition`, optionally restricted to `start_nodes`
    /// and everything downstream of them.
    ///
    /// # Errors
    /// - [`GraphError::DuplicateTaskCode`] if two tasks share a code.
    /// - [`GraphError::UnknownTaskReference`] if an edge references a missing task.
    /// - [`GraphError::CycleDetected`] if the graph is not acyclic.
    /// - [`GraphError::UnknownStartNode`] if a start node is not in the definition.
    pub fn new(definition: &WorkflowDefinition, start_nodes: &[i64]) -> Result<Self, GraphError> {
        let order = validate_dag(definition)?;

        let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
        for edge in &definition.edges {
            adjacency.entry(edge.pre).or_default().push(edge.post);
        }

        let included: HashSet<i64> = if start_nodes.is_empty() {
            order.iter().copied().collect()
        } else {
            let mut seen = HashSet::new();
            let mut queue = VecDeque::new();
            for &code in start_nodes {
                if !order.contains(&code) {
                    return Err(GraphError::UnknownStartNode(code));
                }
                queue.push_back(code);
            }
            while let Some(code) = queue.pop_front() {
                if !seen.insert(code) {
                    continue;
                }
                if let Some(next) = adjacency.get(&code) {
                    queue.extend(next.iter().copied());
                }
            }
            seen
        };

        let mut tasks = BTreeMap::new();
        let mut predecessors: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        let mut successors: BTreeMap<i64, BTreeSet<i64>> = BTreeMap::new();
        for task in &definition.tasks {
            if included.contains(&task.code) {
                tasks.insert(task.code, TaskExecutionRunnable::new(task.clone()));
                predecessors.insert(task.code, BTreeSet::new());
                successors.insert(task.code, BTreeSet::new());
            }
        }
        for edge in &definition.edges {
            if included.contains(&edge.pre) && included.contains(&edge.post) {
                successors.entry(edge.pre).or_default().insert(edge.post);
                predecessors.entry(edge.post).or_default().insert(edge.pre);
            }
        }

        let start_nodes = order
            .iter()
            .copied()
            .filter(|code| predecessors.get(code).is_some_and(BTreeSet::is_empty))
            .collect();

        Ok(Self {
            tasks,
            predecessors,
            successors,
            start_nodes,
        })
    }

    /// Re-attach persisted attempts after a restart or failover. The latest
    /// attempt of each task wins; finished conditional tasks re-apply their
    /// branch choice.
    pub fn restore(&mut self, instances: impl IntoIterator<Item = TaskInstance>) {
        let mut latest: BTreeMap<i64, TaskInstance> = BTreeMap::new();
        for instance in instances {
            let newer = latest
                .get(&instance.task_code)
                .map_or(true, |current| instance.id > current.id);
            if newer {
                latest.insert(instance.task_code, instance);
            }
        }
        for (code, instance) in latest {
            if let Some(task) = self.tasks.get_mut(&code) {
                task.set_instance(instance);
                task.set_flow(NodeFlow::Active);
            }
        }
        let conditionals: Vec<i64> = self
            .tasks
            .values()
            .filter(|task| task.is_conditional() && task.flow() == NodeFlow::Active)
            .map(TaskExecutionRunnable::code)
            .collect();
        for code in conditionals {
            self.apply_condition_branch(code);
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// # Panics
    /// If `code` is not part of the graph.
    pub fn task(&self, code: i64) -> &TaskExecutionRunnable {
        self.tasks
            .get(&code)
            .unwrap_or_else(|| panic!("unknown task code {code} in execution graph"))
    }

    pub(crate) fn task_mut(&mut self, code: i64) -> &mut TaskExecutionRunnable {
        self.tasks
            .get_mut(&code)
            .unwrap_or_else(|| panic!("unknown task code {code} in execution graph"))
    }

    pub fn contains(&self, code: i64) -> bool {
        self.tasks.contains_key(&code)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskExecutionRunnable> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Nodes without predecessors, in topological order.
    pub fn start_nodes(&self) -> Vec<i64> {
        self.start_nodes.clone()
    }

    pub fn predecessors(&self, code: i64) -> BTreeSet<i64> {
        self.predecessors
            .get(&code)
            .cloned()
            .unwrap_or_else(|| panic!("unknown task code {code} in execution graph"))
    }

    pub fn successors(&self, code: i64) -> BTreeSet<i64> {
        self.successors
            .get(&code)
            .cloned()
            .unwrap_or_else(|| panic!("unknown task code {code} in execution graph"))
    }

    pub fn pending_nodes(&self) -> Vec<i64> {
        self.tasks
            .values()
            .filter(|task| task.flow() == NodeFlow::Pending)
            .map(TaskExecutionRunnable::code)
            .collect()
    }

    /// Task code whose latest attempt has this instance id.
    pub fn find_by_instance_id(&self, task_instance_id: i64) -> Option<i64> {
        self.tasks
            .values()
            .find(|task| task.instance().is_some_and(|i| i.id == task_instance_id))
            .map(TaskExecutionRunnable::code)
    }

    /// Active tasks that were persisted but never reached a worker.
    pub fn undispatched_tasks(&self) -> Vec<(i64, i64)> {
        self.tasks
            .values()
            .filter(|task| task.flow() == NodeFlow::Active)
            .filter_map(|task| {
                let instance = task.instance()?;
                (instance.status == TaskExecutionStatus::Submitted && instance.host.is_none())
                    .then_some((task.code(), instance.id))
            })
            .collect()
    }

    /// Tasks a worker may still hold: `(code, task_instance_id, host)`.
    pub fn in_flight_tasks(&self) -> Vec<(i64, i64, Option<String>)> {
        self.tasks
            .values()
            .filter(|task| task.is_in_flight())
            .filter_map(|task| {
                let instance = task.instance()?;
                Some((task.code(), instance.id, instance.host.clone()))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Readiness
    // -----------------------------------------------------------------------

    pub fn resolution(&self, code: i64) -> Resolution {
        let task = self.task(code);
        match task.flow() {
            NodeFlow::Pending => Resolution::Unresolved,
            NodeFlow::Inactive if task.is_skipped() => Resolution::Skipped,
            NodeFlow::Inactive => Resolution::Forbidden,
            NodeFlow::Active => match task.status() {
                Some(TaskExecutionStatus::Success) => Resolution::Ran,
                Some(TaskExecutionStatus::Failure) if task.is_conditional() => Resolution::Ran,
                _ => Resolution::Unresolved,
            },
        }
    }

    /// True iff every predecessor of `code` is resolved.
    pub fn is_trigger_condition_met(&self, code: i64) -> bool {
        self.predecessors(code)
            .into_iter()
            .all(|pre| self.resolution(pre) != Resolution::Unresolved)
    }

    /// Whether `code` must be passed over instead of run: it was explicitly
    /// skipped by a branch, or every predecessor was passed over and at least
    /// one of them was skipped.
    pub fn should_skip(&self, code: i64) -> bool {
        if self.task(code).is_skipped() {
            return true;
        }
        let predecessors = self.predecessors(code);
        if predecessors.is_empty() {
            return false;
        }
        let mut any_skipped = false;
        for pre in predecessors {
            match self.resolution(pre) {
                Resolution::Skipped => any_skipped = true,
                Resolution::Forbidden => {}
                Resolution::Ran | Resolution::Unresolved => return false,
            }
        }
        any_skipped
    }

    /// True iff nothing downstream of `code` can be reached through it.
    pub fn is_end_of_chain(&self, code: i64) -> bool {
        self.successors(code).is_empty() || self.resolution(code) == Resolution::Unresolved
    }

    /// Pending nodes that would run next, looking through forbidden and
    /// skipped nodes without mutating the graph.
    pub fn next_ready_tasks(&self) -> BTreeSet<i64> {
        let mut simulated = self.clone();
        let mut ready = BTreeSet::new();
        loop {
            let mut progressed = false;
            for code in simulated.pending_nodes() {
                if ready.contains(&code) || !simulated.is_trigger_condition_met(code) {
                    continue;
                }
                let skip = simulated.should_skip(code);
                if skip || simulated.task(code).is_forbidden() {
                    if skip {
                        simulated.mark_skipped(code);
                    }
                    simulated.mark_active(code);
                    simulated.mark_inactive(code);
                    progressed = true;
                } else {
                    ready.insert(code);
                }
            }
            if !progressed {
                return ready;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn mark_active(&mut self, code: i64) {
        let task = self.task_mut(code);
        if task.flow() == NodeFlow::Pending {
            task.set_flow(NodeFlow::Active);
        }
    }

    pub fn mark_inactive(&mut self, code: i64) {
        self.task_mut(code).set_flow(NodeFlow::Inactive);
    }

    pub fn mark_skipped(&mut self, code: i64) {
        self.task_mut(code).set_skipped();
    }

    pub(crate) fn mark_pending(&mut self, code: i64) {
        self.task_mut(code).set_flow(NodeFlow::Pending);
    }

    pub(crate) fn record_instance(&mut self, code: i64, instance: TaskInstance) {
        self.task_mut(code).set_instance(instance);
    }

    /// Mark the branch a finished conditional task did *not* choose as
    /// skipped. Returns the newly skipped codes.
    pub fn apply_condition_branch(&mut self, code: i64) -> Vec<i64> {
        let task = self.task(code);
        let Some(branches) = task.definition().condition.clone() else {
            return Vec::new();
        };
        let (chosen, other) = match task.status() {
            Some(TaskExecutionStatus::Success) => (branches.success_nodes, branches.failed_nodes),
            Some(TaskExecutionStatus::Failure) => (branches.failed_nodes, branches.success_nodes),
            _ => return Vec::new(),
        };
        let mut skipped = Vec::new();
        for node in other {
            if !self.contains(node) || chosen.contains(&node) || self.task(node).is_skipped() {
                continue;
            }
            self.mark_skipped(node);
            skipped.push(node);
        }
        skipped
    }

    /// Return paused, killed and failed nodes to `Pending` so a resumed or
    /// recovered instance runs them again.
    pub fn reset_for_rerun(&mut self) -> Vec<i64> {
        self.reset_where(|task| {
            matches!(
                task.status(),
                Some(
                    TaskExecutionStatus::Paused
                        | TaskExecutionStatus::Killed
                        | TaskExecutionStatus::NeedFaultTolerance
                )
            ) || (task.status() == Some(TaskExecutionStatus::Failure) && !task.is_conditional())
        })
    }

    /// Return nodes whose worker was lost to `Pending`.
    pub fn reset_fault_tolerant(&mut self) -> Vec<i64> {
        self.reset_where(|task| task.status() == Some(TaskExecutionStatus::NeedFaultTolerance))
    }

    fn reset_where(&mut self, predicate: impl Fn(&TaskExecutionRunnable) -> bool) -> Vec<i64> {
        let mut reset = Vec::new();
        for task in self.tasks.values_mut() {
            if task.flow() == NodeFlow::Active && predicate(task) {
                task.set_flow(NodeFlow::Pending);
                task.clear_instance();
                reset.push(task.code());
            }
        }
        reset
    }

    // -----------------------------------------------------------------------
    // Whole-graph predicates
    // -----------------------------------------------------------------------

    pub fn has_in_flight(&self) -> bool {
        self.tasks.values().any(TaskExecutionRunnable::is_in_flight)
    }

    /// Nothing is running and no pending node can be triggered any more.
    pub fn is_all_chain_finished(&self) -> bool {
        !self.has_in_flight()
            && !self.tasks.values().any(|task| {
                task.flow() == NodeFlow::Pending && self.is_trigger_condition_met(task.code())
            })
    }

    /// A non-conditional task failed for good. Tasks lost with their worker
    /// are re-run, so they do not count.
    pub fn is_exist_failure_chain(&self) -> bool {
        self.any_active_with(|task| {
            !task.is_conditional() && task.status() == Some(TaskExecutionStatus::Failure)
        })
    }

    pub fn is_exist_pause_chain(&self) -> bool {
        self.any_active_with(|task| task.status() == Some(TaskExecutionStatus::Paused))
    }

    pub fn is_exist_kill_chain(&self) -> bool {
        self.any_active_with(|task| task.status() == Some(TaskExecutionStatus::Killed))
    }

    /// Every node was reached and every node that ran succeeded.
    pub fn is_all_chain_success(&self) -> bool {
        self.tasks.values().all(|task| match task.flow() {
            NodeFlow::Pending => false,
            NodeFlow::Inactive => true,
            NodeFlow::Active => self.resolution(task.code()) == Resolution::Ran,
        })
    }

    fn any_active_with(&self, predicate: impl Fn(&TaskExecutionRunnable) -> bool) -> bool {
        self.tasks
            .values()
            .any(|task| task.flow() == NodeFlow::Active && predicate(task))
    }
}

/// Validate the definition's DAG and return task codes in topological order.
///
/// # Errors
/// See [`ExecutionGraph::new`].
pub fn validate_dag(definition: &WorkflowDefinition) -> Result<Vec<i64>, GraphError> {
    let mut seen: HashSet<i64> = HashSet::new();
    for task in &definition.tasks {
        if !seen.insert(task.code) {
            return Err(GraphError::DuplicateTaskCode(task.code));
        }
    }

    for edge in &definition.edges {
        if !seen.contains(&edge.pre) {
            return Err(GraphError::UnknownTaskReference {
                code: edge.pre,
                side: "pre",
            });
        }
        if !seen.contains(&edge.post) {
            return Err(GraphError::UnknownTaskReference {
                code: edge.post,
                side: "post",
            });
        }
    }

    // Kahn's algorithm, seeded in definition order so the result is stable.
    let mut adjacency: HashMap<i64, Vec<i64>> = HashMap::new();
    let mut in_degree: HashMap<i64, usize> = HashMap::new();
    for task in &definition.tasks {
        adjacency.entry(task.code).or_default();
        in_degree.entry(task.code).or_insert(0);
    }
    for edge in &definition.edges {
        adjacency.entry(edge.pre).or_default().push(edge.post);
        *in_degree.entry(edge.post).or_insert(0) += 1;
    }

    let mut queue: VecDeque<i64> = definition
        .tasks
        .iter()
        .map(|task| task.code)
        .filter(|code| in_degree[code] == 0)
        .collect();
    let mut sorted = Vec::with_capacity(definition.tasks.len());

    while let Some(code) = queue.pop_front() {
        sorted.push(code);
        for &next in &adjacency[&code] {
            let degree = in_degree.entry(next).or_insert(0);
            *degree -= 1;
            if *degree == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted.len() != definition.tasks.len() {
        return Err(GraphError::CycleDetected);
    }

    Ok(sorted)
}
