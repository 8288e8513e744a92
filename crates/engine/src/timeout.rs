//! Emits one `Timeout` event per live instance that outran its declared
//! budget. The event only alerts; it never terminates the instance.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::background::shutdown_requested;
use crate::context::EngineContext;
use crate::dispatcher::EventDispatcher;
use crate::event::WorkflowEvent;

pub struct TimeoutChecker {
    ctx: EngineContext,
    dispatcher: EventDispatcher,
}

impl TimeoutChecker {
    pub fn new(ctx: EngineContext, dispatcher: EventDispatcher) -> Self {
        Self { ctx, dispatcher }
    }

    /// Returns the number of timeout events emitted.
    pub fn check_at(&self, now: DateTime<Utc>) -> usize {
        let mut emitted = 0;
        for runnable in self.ctx.runnables.snapshot() {
            let instance = runnable.instance();
            let Some(minutes) = instance.timeout_minutes else {
                continue;
            };
            if instance.state.is_finished()
                || now - instance.start_time < Duration::minutes(i64::from(minutes))
            {
                continue;
            }
            if !runnable.claim_timeout_alert() {
                continue;
            }
            match self.dispatcher.dispatch(WorkflowEvent::timeout(instance.id)) {
                Ok(()) => emitted += 1,
                Err(err) => warn!(workflow_instance_id = instance.id, error = %err, "could not queue timeout"),
            }
        }
        emitted
    }

    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(self.ctx.config.timeout_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("timeout checker shutting down");
                    break;
                }
            }
            self.check_at(Utc::now());
        }
    }
}
