//! `registry` crate: the coordination service the masters share.
//!
//! Exposes peer liveness, server startup times and cluster-wide mutual
//! exclusion through [`RegistryClient`]. [`MemoryRegistry`] backs the
//! single-process server and tests.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Master,
    Worker,
}

/// A live server as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub host: String,
    pub node_type: NodeType,
    pub startup_time: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The coordination service could not be reached.
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

impl RegistryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn is_node_alive(&self, host: &str, node_type: NodeType) -> Result<bool, RegistryError>;

    /// Try to take the lock at `path`. `Ok(false)` means someone else holds it.
    /// Re-acquiring a lock this client already holds succeeds.
    async fn acquire_lock(&self, path: &str) -> Result<bool, RegistryError>;

    /// Release the lock at `path`. Releasing an unheld lock is a no-op.
    async fn release_lock(&self, path: &str) -> Result<(), RegistryError>;

    async fn list_servers(&self, node_type: NodeType) -> Result<Vec<Server>, RegistryError>;
}

/// Lock path guarding the failover of one dead master.
pub fn master_failover_lock_path(host: &str) -> String {
    format!("/lock/failover/master/{host}")
}
