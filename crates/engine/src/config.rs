use std::time::Duration;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for one master process.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// Address this master registers under; persisted as the owner of the
    /// workflow instances it runs.
    pub host: String,
    /// How often the event engine scans for instances with queued events.
    pub tick_interval: Duration,
    /// Maximum number of instances drained concurrently.
    pub drain_pool_size: usize,
    /// Maximum number of in-flight asynchronous events (worker calls, alerts).
    pub async_pool_size: usize,
    /// Back-off before re-dispatching a task no worker would accept.
    pub dispatch_retry_interval: Duration,
    pub failover_interval: Duration,
    /// Kill tasks on a restarted worker before re-running them elsewhere.
    pub kill_orphaned_tasks: bool,
    pub timeout_check_interval: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1:5678".to_string(),
            tick_interval: Duration::from_millis(100),
            drain_pool_size: 8,
            async_pool_size: 32,
            dispatch_retry_interval: Duration::from_secs(1),
            failover_interval: Duration::from_secs(10),
            kill_orphaned_tasks: true,
            timeout_check_interval: Duration::from_secs(30),
        }
    }
}

impl MasterConfig {
    pub fn with_host(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }
}
