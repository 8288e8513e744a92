pub mod executions;
pub mod task_events;
pub mod workflows;
