//! Row structs for everything the scheduler persists.
//!
//! These are *persistence* models: workflow definitions, workflow instances,
//! task instances and submission commands. The only behaviour they carry is
//! status classification, which both the store and the engine need.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowExecutionStatus {
    Submitted,
    Running,
    ReadyPause,
    Paused,
    ReadyStop,
    Stopped,
    SerialWait,
    Failed,
    Success,
    Failover,
    WaitToRun,
}

impl WorkflowExecutionStatus {
    /// Every declared state.
    pub const ALL: [WorkflowExecutionStatus; 11] = [
        Self::Submitted,
        Self::Running,
        Self::ReadyPause,
        Self::Paused,
        Self::ReadyStop,
        Self::Stopped,
        Self::SerialWait,
        Self::Failed,
        Self::Success,
        Self::Failover,
        Self::WaitToRun,
    ];

    /// Paused, stopped, failed and succeeded instances no longer run tasks.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Self::Paused | Self::Stopped | Self::Failed | Self::Success
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::ReadyPause => "READY_PAUSE",
            Self::Paused => "PAUSED",
            Self::ReadyStop => "READY_STOP",
            Self::Stopped => "STOPPED",
            Self::SerialWait => "SERIAL_WAIT",
            Self::Failed => "FAILED",
            Self::Success => "SUCCESS",
            Self::Failover => "FAILOVER",
            Self::WaitToRun => "WAIT_TO_RUN",
        }
    }
}

impl std::fmt::Display for WorkflowExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown workflow execution status: {s}"))
    }
}

/// Execution state of one task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskExecutionStatus {
    Submitted,
    Dispatch,
    Running,
    Delay,
    ReadyPause,
    ReadyStop,
    Paused,
    Killed,
    Success,
    Failure,
    NeedFaultTolerance,
}

impl TaskExecutionStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            Self::Paused | Self::Killed | Self::Success | Self::Failure | Self::NeedFaultTolerance
        )
    }

    /// Statuses in which a worker may still be holding the task.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Submitted
                | Self::Dispatch
                | Self::Running
                | Self::Delay
                | Self::ReadyPause
                | Self::ReadyStop
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Submitted => "SUBMITTED",
            Self::Dispatch => "DISPATCH",
            Self::Running => "RUNNING",
            Self::Delay => "DELAY",
            Self::ReadyPause => "READY_PAUSE",
            Self::ReadyStop => "READY_STOP",
            Self::Paused => "PAUSED",
            Self::Killed => "KILLED",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::NeedFaultTolerance => "NEED_FAULT_TOLERANCE",
        }
    }
}

impl std::fmt::Display for TaskExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// What to do with the rest of the graph once a task has failed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStrategy {
    /// Keep running branches that do not depend on the failed task.
    #[default]
    Continue,
    /// Kill everything still in flight.
    End,
}

/// Which workflow outcomes produce an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningType {
    #[default]
    None,
    Success,
    Failure,
    All,
}

impl WarningType {
    pub fn alerts_on_success(self) -> bool {
        matches!(self, Self::Success | Self::All)
    }

    pub fn alerts_on_failure(self) -> bool {
        matches!(self, Self::Failure | Self::All)
    }
}

// ---------------------------------------------------------------------------
// workflow definitions
// ---------------------------------------------------------------------------

/// Branch selection of a conditional task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionBranches {
    /// Followed when the conditional task succeeds.
    pub success_nodes: Vec<i64>,
    /// Followed when the conditional task fails.
    pub failed_nodes: Vec<i64>,
}

/// One node of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub code: i64,
    pub name: String,
    /// Plugin type understood by the workers (`shell`, `sql`, ...).
    pub task_type: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Administratively disabled; passed through without running.
    #[serde(default)]
    pub forbidden: bool,
    #[serde(default)]
    pub max_retry_times: u32,
    #[serde(default)]
    pub retry_interval_secs: u64,
    #[serde(default)]
    pub condition: Option<ConditionBranches>,
}

/// Precedence constraint between two task codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub pre: i64,
    pub post: i64,
}

/// A versioned workflow definition (the DAG users submit).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub code: i64,
    pub version: i32,
    pub name: String,
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub timeout_minutes: Option<u32>,
    #[serde(default)]
    pub warning_recipients: Vec<String>,
}

// ---------------------------------------------------------------------------
// commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    /// Start a new instance of a definition.
    #[default]
    Start,
    /// Re-admit an instance whose master died.
    RecoverFailover,
    /// Continue a paused instance.
    Resume,
    /// Re-run the failed or killed tasks of a finished instance.
    RecoverFailed,
}

/// How a new instance waits before running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Parallel,
    /// Queued behind earlier instances of the same definition.
    Serial,
    /// Admitted but waiting for execution slots.
    WaitForResources,
}

/// A request to admit a workflow instance into a master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default)]
    pub command_type: CommandType,
    pub definition_code: i64,
    pub definition_version: i32,
    /// Required for every command type except `Start`.
    #[serde(default)]
    pub workflow_instance_id: Option<i64>,
    /// Restrict the run to these tasks and everything downstream of them.
    #[serde(default)]
    pub start_nodes: Vec<i64>,
    #[serde(default)]
    pub failure_strategy: FailureStrategy,
    #[serde(default)]
    pub warning_type: WarningType,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
}

// ---------------------------------------------------------------------------
// workflow_instances
// ---------------------------------------------------------------------------

/// A persisted workflow instance row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Assigned by the store; `0` until created.
    pub id: i64,
    pub name: String,
    pub definition_code: i64,
    pub definition_version: i32,
    pub state: WorkflowExecutionStatus,
    pub command_type: CommandType,
    /// Master currently responsible for the instance.
    pub host: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Set whenever the instance is re-adopted by failover.
    pub restart_time: Option<DateTime<Utc>>,
    pub failure_strategy: FailureStrategy,
    pub warning_type: WarningType,
    pub warning_recipients: Vec<String>,
    pub timeout_minutes: Option<u32>,
    pub start_nodes: Vec<i64>,
}

// ---------------------------------------------------------------------------
// task_instances
// ---------------------------------------------------------------------------

/// A persisted task instance row (one attempt of one task node).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Assigned by the store; `0` until first upsert.
    pub id: i64,
    pub workflow_instance_id: i64,
    pub task_code: i64,
    pub name: String,
    pub task_type: String,
    pub status: TaskExecutionStatus,
    /// Worker the task was dispatched to.
    pub host: Option<String>,
    pub retry_times: u32,
    pub submit_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Cleared once the attempt is superseded or failed over.
    pub alive: bool,
}
