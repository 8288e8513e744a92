//! `engine` crate: the workflow scheduler core: execution graph, per-instance
//! event queues, the state machine, the event engine, failover and timeouts.

pub mod alert;
pub mod background;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod event_engine;
pub mod failover;
pub mod firer;
pub mod graph;
pub mod master;
pub mod repository;
pub mod runnable;
pub mod state;
pub mod task;
pub mod timeout;

pub use alert::{AlertSender, LogAlertSender, MemoryAlertSender};
pub use config::MasterConfig;
pub use context::EngineContext;
pub use coordinator::{TaskEventReport, WorkflowCoordinator};
pub use dispatcher::EventDispatcher;
pub use error::{EngineError, GraphError};
pub use event::{OperationKind, WorkflowEvent, WorkflowStateEvent};
pub use event_engine::EventEngine;
pub use failover::FailoverService;
pub use graph::{validate_dag, ExecutionGraph};
pub use master::{MasterDeps, MasterServer};
pub use state::StateActionTable;

#[cfg(test)]
pub(crate) mod testing;

#[cfg(test)]
mod engine_tests;
