//! The engine loop: finds instances with queued events and drains each of
//! them on the pool, never more than one drain per instance at a time.

use std::sync::Arc;

use dashmap::DashSet;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::background::shutdown_requested;
use crate::context::EngineContext;
use crate::firer::{Drain, EventFirer};
use crate::state::StateActionTable;

/// Clears an instance's firing mark when the drain ends, even by panic.
struct FiringGuard {
    firing: Arc<DashSet<i64>>,
    workflow_instance_id: i64,
}

impl Drop for FiringGuard {
    fn drop(&mut self) {
        self.firing.remove(&self.workflow_instance_id);
    }
}

pub struct EventEngine {
    ctx: EngineContext,
    firer: Arc<EventFirer>,
    firing: Arc<DashSet<i64>>,
    drain_permits: Arc<Semaphore>,
}

impl EventEngine {
    pub fn new(ctx: EngineContext, actions: Arc<StateActionTable>) -> Self {
        let firer = Arc::new(EventFirer::new(ctx.clone(), actions));
        let drain_permits = Arc::new(Semaphore::new(ctx.config.drain_pool_size.max(1)));
        Self {
            ctx,
            firer,
            firing: Arc::new(DashSet::new()),
            drain_permits,
        }
    }

    pub fn is_firing(&self, workflow_instance_id: i64) -> bool {
        self.firing.contains(&workflow_instance_id)
    }

    /// One scan over the live runnables. Starts a drain for every instance
    /// that has queued events and is not already being drained.
    pub fn tick(&self) -> Vec<JoinHandle<Drain>> {
        let mut started = Vec::new();
        for runnable in self.ctx.runnables.snapshot() {
            if runnable.repository().is_empty() {
                continue;
            }
            // The insert is the test-and-set: only one tick wins.
            if !self.firing.insert(runnable.id()) {
                continue;
            }
            let guard = FiringGuard {
                firing: Arc::clone(&self.firing),
                workflow_instance_id: runnable.id(),
            };
            let firer = Arc::clone(&self.firer);
            let permits = Arc::clone(&self.drain_permits);
            let wakeup = Arc::clone(&self.ctx.wakeup);
            started.push(tokio::spawn(async move {
                let drain = match permits.acquire_owned().await {
                    Ok(_permit) => firer.drain(&runnable).await,
                    Err(_) => Drain {
                        fired: 0,
                        requeued: false,
                    },
                };
                drop(guard);
                // Events pushed after the last pop would otherwise wait for
                // the next tick. A requeued event does wait.
                if !drain.requeued && !runnable.repository().is_empty() {
                    wakeup.notify_one();
                }
                debug!(
                    workflow_instance_id = runnable.id(),
                    fired = drain.fired,
                    requeued = drain.requeued,
                    "drain finished"
                );
                drain
            }));
        }
        started
    }

    /// Tick on the interval or whenever an event is queued, until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            tick_interval_ms = self.ctx.config.tick_interval.as_millis(),
            drain_pool_size = self.ctx.config.drain_pool_size,
            "starting event engine"
        );
        let mut ticker = interval(self.ctx.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.ctx.wakeup.notified() => {}
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("event engine shutting down");
                    break;
                }
            }
            self.tick();
        }
    }
}
