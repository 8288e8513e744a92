//! The persistence contract the scheduler core is written against.
//!
//! Every method is atomic per row. Connectivity failures surface as
//! [`DbError::Unavailable`] so callers can roll back in-memory state and retry.

use async_trait::async_trait;

use crate::{
    models::{TaskInstance, WorkflowDefinition, WorkflowInstance},
    DbError,
};

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn save_workflow_definition(&self, definition: &WorkflowDefinition)
        -> Result<(), DbError>;

    async fn load_workflow_definition(
        &self,
        code: i64,
        version: i32,
    ) -> Result<WorkflowDefinition, DbError>;

    /// Insert a new instance and return its assigned id.
    async fn create_workflow_instance(&self, instance: &WorkflowInstance) -> Result<i64, DbError>;

    async fn load_workflow_instance(&self, id: i64) -> Result<WorkflowInstance, DbError>;

    async fn update_workflow_instance(&self, instance: &WorkflowInstance) -> Result<(), DbError>;

    /// Distinct hosts that still own unfinished workflow instances.
    async fn query_failover_hosts(&self) -> Result<Vec<String>, DbError>;

    /// Unfinished workflow instances owned by `host`.
    async fn query_instances_needing_failover(
        &self,
        host: &str,
    ) -> Result<Vec<WorkflowInstance>, DbError>;

    async fn load_task_instance(&self, id: i64) -> Result<TaskInstance, DbError>;

    /// Insert when `instance.id == 0`, update otherwise. Returns the row id.
    async fn upsert_task_instance(&self, instance: &TaskInstance) -> Result<i64, DbError>;

    /// All task instances of one workflow instance, oldest first.
    async fn list_task_instances(
        &self,
        workflow_instance_id: i64,
    ) -> Result<Vec<TaskInstance>, DbError>;
}
