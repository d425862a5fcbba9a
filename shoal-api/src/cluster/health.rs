///! Heartbeat-driven cluster health
///!
///! Health is derived on every request from node-to-host resolution and heartbeat
///! age. Nothing here is persisted.

use chrono::{DateTime, Utc};
use shoal_common::{
    Cluster, ClusterHealth, ClusterStatusInfo, HostInfo, Node, NodeStatusInfo, Result,
};
use std::collections::HashMap;
use std::time::Duration;

use crate::hosts::HostDirectory;
use crate::registry::Registry;

/// Derives online state and cluster health from host heartbeats
#[derive(Debug, Clone, Copy)]
pub struct HealthAggregator {
    heartbeat_timeout: Duration,
}

impl HealthAggregator {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self { heartbeat_timeout }
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_timeout
    }

    /// A host is online iff it has heartbeated within the timeout
    pub fn is_online(&self, host: &HostInfo, now: DateTime<Utc>) -> bool {
        match host.last_heartbeat {
            // A heartbeat stamped slightly ahead of our clock still counts
            Some(last) => match (now - last).to_std() {
                Ok(elapsed) => elapsed <= self.heartbeat_timeout,
                Err(_) => true,
            },
            None => false,
        }
    }

    /// Evaluate cluster health from already-resolved hosts
    pub fn evaluate(
        &self,
        cluster: &Cluster,
        nodes: &[Node],
        hosts: &HashMap<i64, HostInfo>,
        now: DateTime<Utc>,
    ) -> ClusterStatusInfo {
        let node_infos: Vec<NodeStatusInfo> = nodes
            .iter()
            .map(|node| {
                let host = hosts.get(&node.host_id);
                NodeStatusInfo {
                    node_id: node.id,
                    host_id: node.host_id,
                    host_name: host.map(|h| h.name.clone()),
                    host_ip: host.map(|h| h.ip_address.clone()),
                    role: node.role,
                    status: node.status,
                    is_online: host.is_some_and(|h| self.is_online(h, now)),
                }
            })
            .collect();

        let online_nodes = node_infos.iter().filter(|n| n.is_online).count();
        let total_nodes = node_infos.len();
        let offline_nodes = total_nodes - online_nodes;

        let health = if total_nodes == 0 {
            ClusterHealth::Unknown
        } else if offline_nodes > 0 {
            ClusterHealth::Unhealthy
        } else {
            ClusterHealth::Healthy
        };

        ClusterStatusInfo {
            cluster_id: cluster.id,
            cluster_name: cluster.name.clone(),
            status: cluster.status,
            health,
            total_nodes,
            online_nodes,
            offline_nodes,
            nodes: node_infos,
        }
    }

    /// Load a cluster and evaluate its health as of now
    pub async fn cluster_status(
        &self,
        registry: &Registry,
        directory: &dyn HostDirectory,
        cluster_id: i64,
    ) -> Result<ClusterStatusInfo> {
        let (cluster, nodes) = registry.get_cluster_with_nodes(cluster_id).await?;
        let host_ids: Vec<i64> = nodes.iter().map(|n| n.host_id).collect();
        let hosts = directory.get_hosts(&host_ids).await?;

        Ok(self.evaluate(&cluster, &nodes, &hosts, Utc::now()))
    }
}
