//! In-memory [`WorkflowStore`] used by the single-process server and tests.
//!
//! Supports simulated outages: while unavailable (or while the injected
//! failure budget lasts) every call fails with [`DbError::Unavailable`].
//! Failures can also be aimed at one method, to break a caller between two
//! store calls.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    models::{TaskInstance, WorkflowDefinition, WorkflowInstance},
    store::WorkflowStore,
    DbError,
};

#[derive(Default)]
struct Tables {
    definitions: HashMap<(i64, i32), WorkflowDefinition>,
    workflow_instances: BTreeMap<i64, WorkflowInstance>,
    task_instances: BTreeMap<i64, TaskInstance>,
    next_workflow_instance_id: i64,
    next_task_instance_id: i64,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
    unavailable: AtomicBool,
    failure_budget: AtomicUsize,
    method_failures: Mutex<HashMap<&'static str, usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            unavailable: AtomicBool::new(false),
            failure_budget: AtomicUsize::new(0),
            method_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Toggle a simulated outage.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Make the next `count` calls fail as if the store were unreachable.
    pub fn fail_next_calls(&self, count: usize) {
        self.failure_budget.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `method` fail while every other call
    /// succeeds. `method` is the [`WorkflowStore`] method name.
    pub fn fail_next_calls_to(&self, method: &'static str, count: usize) {
        self.method_failures.lock().insert(method, count);
    }

    /// Snapshot of every workflow instance row.
    pub fn workflow_instances(&self) -> Vec<WorkflowInstance> {
        self.tables
            .lock()
            .workflow_instances
            .values()
            .cloned()
            .collect()
    }

    fn check_available(&self, method: &'static str) -> Result<(), DbError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DbError::Unavailable("memory store is offline".into()));
        }
        let consumed = self
            .failure_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if consumed.is_ok() {
            return Err(DbError::Unavailable("injected store failure".into()));
        }
        if let Some(left) = self.method_failures.lock().get_mut(method) {
            if *left > 0 {
                *left -= 1;
                return Err(DbError::Unavailable(format!("injected {method} failure")));
            }
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn save_workflow_definition(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<(), DbError> {
        self.check_available("save_workflow_definition")?;
        self.tables
            .lock()
            .definitions
            .insert((definition.code, definition.version), definition.clone());
        debug!(code = definition.code, version = definition.version, "saved workflow definition");
        Ok(())
    }

    async fn load_workflow_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<WorkflowDefinition, DbError> {
        self.check_available("load_workflow_definition")?;
        self.tables
            .lock()
            .definitions
            .get(&(code, version))
            .cloned()
            .ok_or_else(|| DbError::not_found("workflow definition", format!("{code}:{version}")))
    }

    async fn create_workflow_instance(&self, instance: &WorkflowInstance) -> Result<i64, DbError> {
        self.check_available("create_workflow_instance")?;
        let mut tables = self.tables.lock();
        tables.next_workflow_instance_id += 1;
        let id = tables.next_workflow_instance_id;
        let mut row = instance.clone();
        row.id = id;
        tables.workflow_instances.insert(id, row);
        trace!(workflow_instance_id = id, "inserted workflow instance");
        Ok(id)
    }

    async fn load_workflow_instance(&self, id: i64) -> Result<WorkflowInstance, DbError> {
        self.check_available("load_workflow_instance")?;
        self.tables
            .lock()
            .workflow_instances
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("workflow instance", id))
    }

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), DbError> {
        self.check_available("update_workflow_instance")?;
        let mut tables = self.tables.lock();
        match tables.workflow_instances.get_mut(&instance.id) {
            Some(row) => {
                *row = instance.clone();
                trace!(workflow_instance_id = instance.id, state = %instance.state, "updated workflow instance");
                Ok(())
            }
            None => Err(DbError::not_found("workflow instance", instance.id)),
        }
    }

    async fn query_failover_hosts(&self) -> Result<Vec<String>, DbError> {
        self.check_available("query_failover_hosts")?;
        let hosts: BTreeSet<String> = self
            .tables
            .lock()
            .workflow_instances
            .values()
            .filter(|row| !row.state.is_finished())
            .filter_map(|row| row.host.clone())
            .collect();
        Ok(hosts.into_iter().collect())
    }

    async fn query_instances_needing_failover(
        &self,
        host: &str,
    ) -> Result<Vec<WorkflowInstance>, DbError> {
        self.check_available("query_instances_needing_failover")?;
        Ok(self
            .tables
            .lock()
            .workflow_instances
            .values()
            .filter(|row| !row.state.is_finished() && row.host.as_deref() == Some(host))
            .cloned()
            .collect())
    }

    async fn load_task_instance(&self, id: i64) -> Result<TaskInstance, DbError> {
        self.check_available("load_task_instance")?;
        self.tables
            .lock()
            .task_instances
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::not_found("task instance", id))
    }

    async fn upsert_task_instance(&self, instance: &TaskInstance) -> Result<i64, DbError> {
        self.check_available("upsert_task_instance")?;
        let mut tables = self.tables.lock();
        let id = if instance.id == 0 {
            tables.next_task_instance_id += 1;
            tables.next_task_instance_id
        } else if tables.task_instances.contains_key(&instance.id) {
            instance.id
        } else {
            return Err(DbError::not_found("task instance", instance.id));
        };
        let mut row = instance.clone();
        row.id = id;
        tables.task_instances.insert(id, row);
        trace!(task_instance_id = id, status = %instance.status, "upserted task instance");
        Ok(id)
    }

    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, DbError> {
        self.check_available("list_task_instances")?;
        Ok(self
            .tables
            .lock()
            .task_instances
            .values()
            .filter(|row| row.workflow_instance_id == workflow_instance_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        CommandType, FailureStrategy, TaskExecutionStatus, WarningType, WorkflowExecutionStatus,
    };
    use chrono::Utc;

    fn instance(host: &str, state: WorkflowExecutionStatus) -> WorkflowInstance {
        WorkflowInstance {
            id: 0,
            name: "wf".into(),
            definition_code: 1,
            definition_version: 1,
            state,
            command_type: CommandType::Start,
            host: Some(host.into()),
            start_time: Utc::now(),
            end_time: None,
            restart_time: None,
            failure_strategy: FailureStrategy::Continue,
            warning_type: WarningType::None,
            warning_recipients: vec![],
            timeout_minutes: None,
            start_nodes: vec![],
        }
    }

    fn task(workflow_instance_id: i64) -> TaskInstance {
        TaskInstance {
            id: 0,
            workflow_instance_id,
            task_code: 1,
            name: "t".into(),
            task_type: "shell".into(),
            status: TaskExecutionStatus::Submitted,
            host: None,
            retry_times: 0,
            submit_time: Utc::now(),
            start_time: None,
            end_time: None,
            alive: true,
        }
    }

    #[tokio::test]
    async fn failover_queries_skip_finished_instances() {
        let store = MemoryStore::new();
        store
            .create_workflow_instance(&instance("m1", WorkflowExecutionStatus::Running))
            .await
            .unwrap();
        store
            .create_workflow_instance(&instance("m1", WorkflowExecutionStatus::Success))
            .await
            .unwrap();
        store
            .create_workflow_instance(&instance("m2", WorkflowExecutionStatus::Paused))
            .await
            .unwrap();

        assert_eq!(store.query_failover_hosts().await.unwrap(), vec!["m1".to_string()]);
        let rows = store.query_instances_needing_failover("m1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, WorkflowExecutionStatus::Running);
    }

    #[tokio::test]
    async fn upsert_assigns_ids_then_updates_in_place() {
        let store = MemoryStore::new();
        let id = store.upsert_task_instance(&task(9)).await.unwrap();
        let mut row = store.load_task_instance(id).await.unwrap();
        row.status = TaskExecutionStatus::Success;
        assert_eq!(store.upsert_task_instance(&row).await.unwrap(), id);

        let rows = store.list_task_instances(9).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, TaskExecutionStatus::Success);
    }

    #[tokio::test]
    async fn injected_failures_are_transient_and_run_out() {
        let store = MemoryStore::new();
        store.fail_next_calls(2);
        for _ in 0..2 {
            let err = store.load_task_instance(1).await.unwrap_err();
            assert!(err.is_transient());
        }
        let err = store.load_task_instance(1).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn aimed_failures_leave_other_methods_alone() {
        let store = MemoryStore::new();
        store.fail_next_calls_to("upsert_task_instance", 1);
        assert!(store.list_task_instances(1).await.unwrap().is_empty());
        assert!(store.upsert_task_instance(&task(1)).await.unwrap_err().is_transient());
        assert_eq!(store.upsert_task_instance(&task(1)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn offline_store_rejects_everything() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(store.query_failover_hosts().await.unwrap_err().is_transient());
        store.set_available(true);
        assert!(store.query_failover_hosts().await.is_ok());
    }
}
