///! Cluster management
///! Admission of nodes against the host directory, per-cluster write locks,
///! health derivation and lifecycle operations

pub mod health;
pub mod operations;

use shoal_common::{Error, Node, Result};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::hosts::HostDirectory;
use crate::registry::{NewNode, Registry, UpdateNodeRequest};

pub use health::HealthAggregator;
pub use operations::OperationOrchestrator;

/// Single-writer locks keyed by cluster id
///
/// Acquisition never waits: a second writer on the same cluster gets
/// `OperationInProgress` immediately.
#[derive(Clone, Default)]
pub struct ClusterLocks {
    held: Arc<Mutex<HashSet<i64>>>,
}

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, cluster_id: i64) -> Result<ClusterGuard> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| Error::System("Cluster lock table poisoned".to_string()))?;

        if !held.insert(cluster_id) {
            debug!(cluster_id, "Cluster already locked by another operation");
            return Err(Error::OperationInProgress(cluster_id));
        }

        Ok(ClusterGuard {
            held: self.held.clone(),
            cluster_id,
        })
    }

    pub fn is_locked(&self, cluster_id: i64) -> bool {
        self.held
            .lock()
            .map(|held| held.contains(&cluster_id))
            .unwrap_or(false)
    }
}

/// Releases the cluster lock on drop
pub struct ClusterGuard {
    held: Arc<Mutex<HashSet<i64>>>,
    cluster_id: i64,
}

impl Drop for ClusterGuard {
    fn drop(&mut self) {
        match self.held.lock() {
            Ok(mut held) => {
                held.remove(&self.cluster_id);
            }
            Err(poisoned) => {
                poisoned.into_inner().remove(&self.cluster_id);
            }
        }
    }
}

/// Registry operations that need the host directory or the cluster lock
#[derive(Clone)]
pub struct ClusterService {
    registry: Registry,
    directory: Arc<dyn HostDirectory>,
    locks: ClusterLocks,
}

impl ClusterService {
    pub fn new(registry: Registry, directory: Arc<dyn HostDirectory>, locks: ClusterLocks) -> Self {
        Self {
            registry,
            directory,
            locks,
        }
    }

    /// Admit a node; the host must exist and have its agent installed
    pub async fn add_node(&self, cluster_id: i64, request: NewNode) -> Result<Node> {
        let host = self
            .directory
            .get_host(request.host_id)
            .await?
            .ok_or(Error::HostNotFound(request.host_id))?;

        if !host.agent_installed() {
            warn!(
                cluster_id,
                host_id = host.id,
                agent_status = host.agent_status.as_str(),
                "Rejecting node on host without an installed agent"
            );
            return Err(Error::AgentNotInstalled(host.id));
        }

        self.registry.add_node(cluster_id, request).await
    }

    pub fn locks(&self) -> &ClusterLocks {
        &self.locks
    }

    /// Delete a cluster while holding its write lock
    pub async fn delete_cluster(&self, cluster_id: i64) -> Result<u64> {
        let _guard = self.locks.try_acquire(cluster_id)?;
        self.registry.delete_cluster(cluster_id).await
    }

    pub async fn update_node(
        &self,
        cluster_id: i64,
        node_id: i64,
        request: UpdateNodeRequest,
    ) -> Result<Node> {
        let _guard = self.locks.try_acquire(cluster_id)?;
        self.registry.update_node(cluster_id, node_id, request).await
    }

    /// Remove a node; refused while the cluster is running or deploying
    pub async fn delete_node(&self, cluster_id: i64, node_id: i64) -> Result<()> {
        let _guard = self.locks.try_acquire(cluster_id)?;
        let cluster = self.registry.get_cluster(cluster_id).await?;
        if cluster.status.blocks_deletion() {
            return Err(Error::ClusterBusy(cluster_id, cluster.status));
        }
        self.registry.delete_node(cluster_id, node_id).await
    }
}
