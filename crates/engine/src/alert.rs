//! Alert delivery for workflow results and timeouts.
//!
//! Alerts are fire-and-forget: a failed send is logged and never changes
//! workflow state.

use async_trait::async_trait;
use db::models::{WorkflowExecutionStatus, WorkflowInstance};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("alert channel unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send_timeout_alert(&self, instance: &WorkflowInstance) -> Result<(), AlertError>;

    async fn send_workflow_result(&self, instance: &WorkflowInstance) -> Result<(), AlertError>;
}

/// Writes alerts to the log. Used when no alert channel is configured.
#[derive(Debug, Default)]
pub struct LogAlertSender;

#[async_trait]
impl AlertSender for LogAlertSender {
    async fn send_timeout_alert(&self, instance: &WorkflowInstance) -> Result<(), AlertError> {
        warn!(
            workflow_instance_id = instance.id,
            name = %instance.name,
            timeout_minutes = ?instance.timeout_minutes,
            recipients = ?instance.warning_recipients,
            "workflow instance exceeded its timeout"
        );
        Ok(())
    }

    async fn send_workflow_result(&self, instance: &WorkflowInstance) -> Result<(), AlertError> {
        info!(
            workflow_instance_id = instance.id,
            name = %instance.name,
            state = %instance.state,
            recipients = ?instance.warning_recipients,
            "workflow instance finished"
        );
        Ok(())
    }
}

/// An alert as captured by [`MemoryAlertSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SentAlert {
    Timeout { workflow_instance_id: i64 },
    Result { workflow_instance_id: i64, state: WorkflowExecutionStatus },
}

/// Records alerts in memory; optionally fails every send.
#[derive(Debug, Default)]
pub struct MemoryAlertSender {
    sent: Mutex<Vec<SentAlert>>,
    failing: bool,
}

impl MemoryAlertSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<SentAlert> {
        self.sent.lock().clone()
    }

    fn record(&self, alert: SentAlert) -> Result<(), AlertError> {
        if self.failing {
            return Err(AlertError::Unavailable("alert channel offline".into()));
        }
        self.sent.lock().push(alert);
        Ok(())
    }
}

#[async_trait]
impl AlertSender for MemoryAlertSender {
    async fn send_timeout_alert(&self, instance: &WorkflowInstance) -> Result<(), AlertError> {
        self.record(SentAlert::Timeout {
            workflow_instance_id: instance.id,
        })
    }

    async fn send_workflow_result(&self, instance: &WorkflowInstance) -> Result<(), AlertError> {
        self.record(SentAlert::Result {
            workflow_instance_id: instance.id,
            state: instance.state,
        })
    }
}
