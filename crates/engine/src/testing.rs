//! Fixtures shared by the engine's unit and end-to-end tests.

use chrono::Utc;
use db::models::{
    CommandType, Edge, FailureStrategy, TaskDefinition, TaskExecutionStatus, TaskInstance,
    WarningType, WorkflowDefinition, WorkflowExecutionStatus, WorkflowInstance,
};
use serde_json::json;

pub fn task_def(code: i64) -> TaskDefinition {
    TaskDefinition {
        code,
        name: format!("task-{code}"),
        task_type: "shell".into(),
        params: json!({ "script": format!("echo {code}") }),
        forbidden: false,
        max_retry_times: 0,
        retry_interval_secs: 0,
        condition: None,
    }
}

pub fn definition(tasks: Vec<TaskDefinition>, edges: &[(i64, i64)]) -> WorkflowDefinition {
    WorkflowDefinition {
        code: 100,
        version: 1,
        name: "test-workflow".into(),
        tasks,
        edges: edges
            .iter()
            .map(|&(pre, post)| Edge { pre, post })
            .collect(),
        timeout_minutes: None,
        warning_recipients: vec!["ops@example.com".into()],
    }
}

pub fn instance_of(id: i64, task_code: i64, status: TaskExecutionStatus) -> TaskInstance {
    TaskInstance {
        id,
        workflow_instance_id: 1,
        task_code,
        name: format!("task-{task_code}"),
        task_type: "shell".into(),
        status,
        host: Some("worker-1".into()),
        retry_times: 0,
        submit_time: Utc::now(),
        start_time: None,
        end_time: None,
        alive: true,
    }
}

pub fn workflow_instance(id: i64, state: WorkflowExecutionStatus) -> WorkflowInstance {
    WorkflowInstance {
        id,
        name: format!("test-workflow-{id}"),
        definition_code: 100,
        definition_version: 1,
        state,
        command_type: CommandType::Start,
        host: Some("master-1".into()),
        start_time: Utc::now(),
        end_time: None,
        restart_time: None,
        failure_strategy: FailureStrategy::Continue,
        warning_type: WarningType::None,
        warning_recipients: Vec::new(),
        timeout_minutes: None,
        start_nodes: Vec::new(),
    }
}
