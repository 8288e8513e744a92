//! Shared handles every engine component works against.

use std::sync::Arc;

use db::WorkflowStore;
use nodes::TaskExecutorClient;
use tokio::sync::Notify;

use crate::alert::AlertSender;
use crate::config::MasterConfig;
use crate::runnable::WorkflowRunnableRegistry;

/// Cheap to clone; every field is reference-counted.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn WorkflowStore>,
    pub runnables: Arc<WorkflowRunnableRegistry>,
    pub executor: Arc<dyn TaskExecutorClient>,
    pub alerts: Arc<dyn AlertSender>,
    /// Poked whenever an event is queued so the engine drains without
    /// waiting for its next tick.
    pub wakeup: Arc<Notify>,
    pub config: Arc<MasterConfig>,
}

impl EngineContext {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        executor: Arc<dyn TaskExecutorClient>,
        alerts: Arc<dyn AlertSender>,
        config: MasterConfig,
    ) -> Self {
        Self {
            store,
            runnables: Arc::new(WorkflowRunnableRegistry::new()),
            executor,
            alerts,
            wakeup: Arc::new(Notify::new()),
            config: Arc::new(config),
        }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }
}
