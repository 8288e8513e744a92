//! Wires one master process together: event engine, failover and timeout
//! loops sharing the same collaborators.

use std::sync::Arc;

use db::WorkflowStore;
use nodes::TaskExecutorClient;
use registry::RegistryClient;
use tracing::info;

use crate::alert::AlertSender;
use crate::background::BackgroundLoop;
use crate::config::MasterConfig;
use crate::context::EngineContext;
use crate::coordinator::WorkflowCoordinator;
use crate::error::EngineError;
use crate::event_engine::EventEngine;
use crate::failover::FailoverService;
use crate::state::StateActionTable;
use crate::timeout::TimeoutChecker;

/// Collaborators a master is built from.
pub struct MasterDeps {
    pub store: Arc<dyn WorkflowStore>,
    pub registry: Arc<dyn RegistryClient>,
    pub executor: Arc<dyn TaskExecutorClient>,
    pub alerts: Arc<dyn AlertSender>,
}

pub struct MasterServer {
    coordinator: Arc<WorkflowCoordinator>,
    failover: Arc<FailoverService>,
    loops: Vec<BackgroundLoop>,
}

impl MasterServer {
    /// Build the state-action table and start every background loop.
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// If the state-action table does not cover every state.
    pub fn start(config: MasterConfig, deps: MasterDeps) -> Result<Self, EngineError> {
        let actions = Arc::new(StateActionTable::standard()?);
        let host = config.host.clone();
        let ctx = EngineContext::new(deps.store, deps.executor, deps.alerts, config);
        let coordinator = Arc::new(WorkflowCoordinator::new(ctx.clone()));
        let engine = Arc::new(EventEngine::new(ctx.clone(), actions));
        let failover = Arc::new(FailoverService::new(
            ctx.clone(),
            Arc::clone(&coordinator),
            deps.registry,
        ));
        let timeout = Arc::new(TimeoutChecker::new(ctx, coordinator.dispatcher().clone()));

        let loops = vec![
            BackgroundLoop::spawn("event-engine", move |rx| engine.run(rx)),
            {
                let failover = Arc::clone(&failover);
                BackgroundLoop::spawn("failover", move |rx| failover.run(rx))
            },
            BackgroundLoop::spawn("timeout-checker", move |rx| timeout.run(rx)),
        ];
        info!(%host, "master started");
        Ok(Self {
            coordinator,
            failover,
            loops,
        })
    }

    pub fn coordinator(&self) -> Arc<WorkflowCoordinator> {
        Arc::clone(&self.coordinator)
    }

    pub fn failover(&self) -> Arc<FailoverService> {
        Arc::clone(&self.failover)
    }

    /// Stop every loop and wait for them to exit. Queued events stay in
    /// memory; persisted state is reconciled by failover on the next start.
    pub async fn shutdown(self) {
        for background in &self.loops {
            background.trigger_shutdown();
        }
        for background in self.loops {
            background.shutdown().await;
        }
        info!("master stopped");
    }
}
