//! Process-local registry. Clones created with [`MemoryRegistry::client`]
//! share one cluster view but hold locks under their own owner name, so
//! several masters can be simulated inside one process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{NodeType, RegistryClient, RegistryError, Server};

#[derive(Default)]
struct Cluster {
    servers: HashMap<(NodeType, String), Server>,
    locks: HashMap<String, String>,
}

#[derive(Clone)]
pub struct MemoryRegistry {
    cluster: Arc<Mutex<Cluster>>,
    owner: String,
}

impl MemoryRegistry {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            cluster: Arc::new(Mutex::new(Cluster::default())),
            owner: owner.into(),
        }
    }

    /// Another handle on the same cluster, holding locks as `owner`.
    pub fn client(&self, owner: impl Into<String>) -> Self {
        Self {
            cluster: Arc::clone(&self.cluster),
            owner: owner.into(),
        }
    }

    pub fn register_server(&self, host: &str, node_type: NodeType, startup_time: DateTime<Utc>) {
        info!(host, ?node_type, %startup_time, "server registered");
        self.cluster.lock().servers.insert(
            (node_type, host.to_string()),
            Server {
                host: host.to_string(),
                node_type,
                startup_time,
            },
        );
    }

    /// Drop a server as if its session expired.
    pub fn remove_server(&self, host: &str, node_type: NodeType) {
        info!(host, ?node_type, "server removed");
        self.cluster
            .lock()
            .servers
            .remove(&(node_type, host.to_string()));
    }

    pub fn lock_holder(&self, path: &str) -> Option<String> {
        self.cluster.lock().locks.get(path).cloned()
    }
}

#[async_trait]
impl RegistryClient for MemoryRegistry {
    async fn is_node_alive(&self, host: &str, node_type: NodeType) -> Result<bool, RegistryError> {
        Ok(self
            .cluster
            .lock()
            .servers
            .contains_key(&(node_type, host.to_string())))
    }

    async fn acquire_lock(&self, path: &str) -> Result<bool, RegistryError> {
        let mut cluster = self.cluster.lock();
        match cluster.locks.get(path) {
            Some(holder) if holder != &self.owner => {
                debug!(path, holder = %holder, "lock held elsewhere");
                Ok(false)
            }
            _ => {
                cluster.locks.insert(path.to_string(), self.owner.clone());
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, path: &str) -> Result<(), RegistryError> {
        let mut cluster = self.cluster.lock();
        if cluster.locks.get(path) == Some(&self.owner) {
            cluster.locks.remove(path);
        }
        Ok(())
    }

    async fn list_servers(&self, node_type: NodeType) -> Result<Vec<Server>, RegistryError> {
        let mut servers: Vec<Server> = self
            .cluster
            .lock()
            .servers
            .values()
            .filter(|server| server.node_type == node_type)
            .cloned()
            .collect();
        servers.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(servers)
    }
}
