//! Cluster-wide lifecycle operations
//!
//! Fans a start/stop/restart out to every node of a cluster with bounded
//! parallelism, persists each node's outcome and settles the cluster status.
//! One pass only: partial failure is reported, never retried.

use chrono::Utc;
use shoal_common::{
    Cluster, ClusterStatus, Error, HostInfo, Node, NodeOperationResult, NodeStatus, Operation,
    OperationResult, Result,
};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use super::{ClusterLocks, HealthAggregator};
use crate::agent::{AgentGateway, CommandParams, Dispatch};
use crate::hosts::HostDirectory;
use crate::log_cluster_operation;
use crate::registry::Registry;

pub const DEFAULT_MAX_PARALLEL: usize = 8;

const QUEUED_MESSAGE: &str = "queued: no agent dispatcher configured, the agent applies it on its own";

/// Executes lifecycle operations across a cluster's nodes
#[derive(Clone)]
pub struct OperationOrchestrator {
    registry: Registry,
    directory: Arc<dyn HostDirectory>,
    gateway: AgentGateway,
    health: HealthAggregator,
    locks: ClusterLocks,
    max_parallel: usize,
}

impl OperationOrchestrator {
    pub fn new(
        registry: Registry,
        directory: Arc<dyn HostDirectory>,
        gateway: AgentGateway,
        health: HealthAggregator,
        locks: ClusterLocks,
    ) -> Self {
        Self {
            registry,
            directory,
            gateway,
            health,
            locks,
            max_parallel: DEFAULT_MAX_PARALLEL,
        }
    }

    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    pub async fn start(&self, cluster_id: i64) -> Result<OperationResult> {
        self.execute(cluster_id, Operation::Start).await
    }

    pub async fn stop(&self, cluster_id: i64) -> Result<OperationResult> {
        self.execute(cluster_id, Operation::Stop).await
    }

    pub async fn restart(&self, cluster_id: i64) -> Result<OperationResult> {
        self.execute(cluster_id, Operation::Restart).await
    }

    pub async fn execute(&self, cluster_id: i64, operation: Operation) -> Result<OperationResult> {
        let _guard = self.locks.try_acquire(cluster_id)?;
        let (cluster, nodes) = self.registry.get_cluster_with_nodes(cluster_id).await?;

        log_cluster_operation!(operation, cluster_id, nodes = nodes.len());

        match self.run(&cluster, &nodes, operation).await {
            Ok(result) => Ok(result),
            Err(e) => {
                error!(cluster_id, operation = %operation, "Cluster operation aborted: {}", e);
                if let Err(status_err) = self
                    .registry
                    .update_cluster_status(cluster_id, ClusterStatus::Error)
                    .await
                {
                    error!(cluster_id, "Failed to mark cluster errored: {}", status_err);
                }
                Err(e)
            }
        }
    }

    /// Body of `execute`; the caller holds the lock and settles failures
    async fn run(
        &self,
        cluster: &Cluster,
        nodes: &[Node],
        operation: Operation,
    ) -> Result<OperationResult> {
        let cluster_id = cluster.id;

        if operation != Operation::Stop {
            self.registry
                .update_cluster_status(cluster_id, ClusterStatus::Deploying)
                .await?;
        }

        if nodes.is_empty() {
            self.registry
                .update_cluster_status(cluster_id, operation.target_cluster_status())
                .await?;
            return Ok(OperationResult {
                cluster_id,
                operation,
                success: true,
                message: format!("Cluster '{}' has no nodes, nothing to {}", cluster.name, operation),
                node_results: Vec::new(),
            });
        }

        let node_results = self.fan_out(operation, nodes).await?;

        // Persist every node outcome before settling the cluster
        let mut persist_error = None;
        for result in &node_results {
            let status = if result.success {
                operation.target_node_status()
            } else {
                NodeStatus::Error
            };
            if let Err(e) = self.registry.update_node_status(result.node_id, status, None).await {
                error!(cluster_id, node_id = result.node_id, "Failed to persist node status: {}", e);
                persist_error.get_or_insert(e);
            }
        }

        let failed = node_results.iter().filter(|r| !r.success).count();
        let cluster_status = if failed == 0 && persist_error.is_none() {
            operation.target_cluster_status()
        } else {
            ClusterStatus::Error
        };
        self.registry
            .update_cluster_status(cluster_id, cluster_status)
            .await?;

        if let Some(e) = persist_error {
            return Err(e);
        }

        let message = if failed == 0 {
            format!("{} succeeded on all {} nodes", operation, node_results.len())
        } else {
            warn!(cluster_id, operation = %operation, failed, "Cluster operation partially failed");
            format!("{} failed on {} of {} nodes", operation, failed, node_results.len())
        };

        info!(cluster_id, operation = %operation, status = %cluster_status, "Cluster operation finished");

        Ok(OperationResult {
            cluster_id,
            operation,
            success: failed == 0,
            message,
            node_results,
        })
    }

    /// Run the operation on every node, at most `max_parallel` at a time
    async fn fan_out(&self, operation: Operation, nodes: &[Node]) -> Result<Vec<NodeOperationResult>> {
        let host_ids: Vec<i64> = nodes.iter().map(|n| n.host_id).collect();
        let hosts = self.directory.get_hosts(&host_ids).await?;

        let semaphore = Arc::new(Semaphore::new(self.max_parallel.min(nodes.len()).max(1)));
        let mut join_set = JoinSet::new();
        let mut pending: HashSet<i64> = HashSet::new();

        for node in nodes.iter().cloned() {
            let sem = semaphore.clone();
            let host = hosts.get(&node.host_id).cloned();
            let gateway = self.gateway.clone();
            let health = self.health;
            pending.insert(node.id);

            join_set.spawn(async move {
                let _permit = sem
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::System("Operation pool closed".to_string()))?;
                Ok::<_, Error>(run_on_node(operation, node, host, gateway, health).await)
            });
        }

        let mut results = Vec::with_capacity(nodes.len());
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(result)) => {
                    pending.remove(&result.node_id);
                    results.push(result);
                }
                Ok(Err(e)) => error!("Node operation task failed: {}", e),
                Err(e) => error!("Node operation task join error: {}", e),
            }
        }

        // Tasks that never reported still count as node failures
        for node in nodes.iter().filter(|n| pending.contains(&n.id)) {
            results.push(NodeOperationResult {
                node_id: node.id,
                host_id: node.host_id,
                host_name: None,
                host_ip: None,
                success: false,
                message: format!("{} task aborted", operation),
            });
        }

        results.sort_by_key(|r| r.node_id);
        Ok(results)
    }
}

async fn run_on_node(
    operation: Operation,
    node: Node,
    host: Option<HostInfo>,
    gateway: AgentGateway,
    health: HealthAggregator,
) -> NodeOperationResult {
    let mut result = NodeOperationResult {
        node_id: node.id,
        host_id: node.host_id,
        host_name: host.as_ref().map(|h| h.name.clone()),
        host_ip: host.as_ref().map(|h| h.ip_address.clone()),
        success: false,
        message: String::new(),
    };

    let Some(host) = host else {
        result.message = Error::HostNotFound(node.host_id).to_string();
        return result;
    };

    if host.category.requires_agent() && !health.is_online(&host, Utc::now()) {
        result.message = Error::HostOffline(host.id).to_string();
        return result;
    }

    let mut params = CommandParams::new();
    params.insert("cluster_id".to_string(), node.cluster_id.to_string());
    params.insert("node_id".to_string(), node.id.to_string());
    params.insert("role".to_string(), node.role.to_string());
    params.insert("install_dir".to_string(), node.install_dir.clone());

    match gateway.send(&host.agent_id, operation.into(), params).await {
        Ok(Dispatch::Sent(reply)) => {
            result.success = reply.success;
            result.message = reply.message;
        }
        Ok(Dispatch::Unconfigured) => {
            result.success = true;
            result.message = format!("{} {}", operation, QUEUED_MESSAGE);
        }
        Err(e) => {
            warn!(node_id = node.id, host_id = host.id, "Agent command failed: {}", e);
            result.message = e.to_string();
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::FakeDispatcher;
    use crate::agent::{AgentDispatcher, CommandReply, CommandType};
    use crate::db::Database;
    use crate::hosts::InMemoryHostDirectory;
    use crate::registry::{CreateClusterRequest, NewNode};
    use async_trait::async_trait;
    use shoal_common::{AgentStatus, DeploymentMode, HostCategory, NodeRole};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Harness {
        registry: Registry,
        directory: InMemoryHostDirectory,
        locks: ClusterLocks,
    }

    impl Harness {
        async fn new() -> Self {
            let db = Database::in_memory().await.unwrap();
            db.migrate().await.unwrap();
            Self {
                registry: Registry::new(db.pool().clone()),
                directory: InMemoryHostDirectory::new(),
                locks: ClusterLocks::new(),
            }
        }

        fn orchestrator(&self, dispatcher: Option<Arc<dyn AgentDispatcher>>) -> OperationOrchestrator {
            OperationOrchestrator::new(
                self.registry.clone(),
                Arc::new(self.directory.clone()),
                AgentGateway::new(dispatcher, Duration::from_secs(1)),
                HealthAggregator::new(Duration::from_secs(30)),
                self.locks.clone(),
            )
        }

        async fn cluster_with_hosts(&self, host_ids: &[i64]) -> i64 {
            let cluster = self
                .registry
                .create_cluster(CreateClusterRequest {
                    name: "demo".to_string(),
                    description: String::new(),
                    deployment_mode: DeploymentMode::Hybrid,
                    version: "2.3.8".to_string(),
                    config: None,
                    install_dir: "/opt/engine".to_string(),
                })
                .await
                .unwrap();

            for &host_id in host_ids {
                self.registry
                    .add_node(
                        cluster.id,
                        NewNode {
                            host_id,
                            role: NodeRole::MasterWorker,
                            install_dir: None,
                            membership_port: 5801,
                            api_port: Some(8080),
                            worker_port: None,
                        },
                    )
                    .await
                    .unwrap();
            }
            cluster.id
        }

        async fn online_host(&self, id: i64, category: HostCategory) {
            self.directory
                .upsert(HostInfo {
                    id,
                    name: format!("host-{}", id),
                    category,
                    ip_address: format!("10.0.0.{}", id),
                    agent_id: format!("agent-{}", id),
                    agent_status: AgentStatus::Installed,
                    last_heartbeat: Some(Utc::now()),
                })
                .await;
        }
    }

    #[tokio::test]
    async fn test_start_all_nodes_succeed() {
        let h = Harness::new().await;
        h.online_host(1, HostCategory::BareMetal).await;
        h.online_host(2, HostCategory::BareMetal).await;
        let cluster_id = h.cluster_with_hosts(&[1, 2]).await;

        let fake = Arc::new(FakeDispatcher::always_ok());
        let result = h.orchestrator(Some(fake.clone())).start(cluster_id).await.unwrap();

        assert!(result.success);
        assert_eq!(result.node_results.len(), 2);
        assert!(result.node_results[0].node_id < result.node_results[1].node_id);
        assert_eq!(fake.commands(), vec![CommandType::Start, CommandType::Start]);

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls[0].2.get("install_dir").map(String::as_str), Some("/opt/engine"));
        assert_eq!(calls[0].2.get("role").map(String::as_str), Some("master/worker"));
        drop(calls);

        let (cluster, nodes) = h.registry.get_cluster_with_nodes(cluster_id).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Running));
    }

    #[tokio::test]
    async fn test_partial_failure_continues_other_nodes() {
        let h = Harness::new().await;
        h.online_host(1, HostCategory::BareMetal).await;
        // host 2 unresolvable, host 3 agent reports failure
        h.online_host(3, HostCategory::BareMetal).await;
        let cluster_id = h.cluster_with_hosts(&[1, 2, 3]).await;

        let fake = Arc::new(FakeDispatcher::new(|agent_id, _, _| {
            if agent_id == "agent-3" {
                Ok(CommandReply::failed("port busy"))
            } else {
                Ok(CommandReply::ok("started"))
            }
        }));
        let result = h.orchestrator(Some(fake.clone())).start(cluster_id).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.message, "start failed on 2 of 3 nodes");
        assert!(result.node_results[0].success);
        assert!(!result.node_results[1].success);
        assert!(result.node_results[1].host_name.is_none());
        assert_eq!(result.node_results[2].message, "port busy");
        assert_eq!(fake.commands().len(), 2);

        let (cluster, nodes) = h.registry.get_cluster_with_nodes(cluster_id).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Error);
        assert_eq!(nodes[0].status, NodeStatus::Running);
        assert_eq!(nodes[1].status, NodeStatus::Error);
        assert_eq!(nodes[2].status, NodeStatus::Error);
    }

    #[tokio::test]
    async fn test_offline_host_only_fails_when_agent_required() {
        let h = Harness::new().await;
        for (id, category) in [(1, HostCategory::BareMetal), (2, HostCategory::Container)] {
            h.directory
                .upsert(HostInfo {
                    id,
                    name: format!("host-{}", id),
                    category,
                    ip_address: format!("10.0.0.{}", id),
                    agent_id: format!("agent-{}", id),
                    agent_status: AgentStatus::Installed,
                    last_heartbeat: Some(Utc::now() - chrono::Duration::minutes(10)),
                })
                .await;
        }
        let cluster_id = h.cluster_with_hosts(&[1, 2]).await;

        let result = h
            .orchestrator(Some(Arc::new(FakeDispatcher::always_ok())))
            .stop(cluster_id)
            .await
            .unwrap();

        assert!(!result.node_results[0].success);
        assert!(result.node_results[0].message.contains("offline"));
        assert!(result.node_results[1].success);
    }

    #[tokio::test]
    async fn test_unconfigured_dispatcher_queues_optimistically() {
        let h = Harness::new().await;
        h.online_host(1, HostCategory::BareMetal).await;
        let cluster_id = h.cluster_with_hosts(&[1]).await;

        let result = h.orchestrator(None).restart(cluster_id).await.unwrap();
        assert!(result.success);
        assert!(result.node_results[0].message.contains("queued"));

        let cluster = h.registry.get_cluster(cluster_id).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
    }

    #[tokio::test]
    async fn test_zero_node_cluster_settles_in_target_status() {
        let h = Harness::new().await;
        let cluster_id = h.cluster_with_hosts(&[]).await;

        let result = h.orchestrator(None).stop(cluster_id).await.unwrap();
        assert!(result.success);
        assert!(result.node_results.is_empty());
        assert_eq!(
            h.registry.get_cluster(cluster_id).await.unwrap().status,
            ClusterStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_concurrent_operation_is_rejected() {
        let h = Harness::new().await;
        h.online_host(1, HostCategory::BareMetal).await;
        let cluster_id = h.cluster_with_hosts(&[1]).await;

        let slow = Arc::new(FakeDispatcher::always_ok().with_delay(Duration::from_millis(300)));
        let orchestrator = h.orchestrator(Some(slow));

        let first = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.start(cluster_id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = orchestrator.stop(cluster_id).await;
        assert!(matches!(second, Err(Error::OperationInProgress(_))));
        assert!(first.await.unwrap().unwrap().success);
    }

    /// Directory whose backing store is unreachable
    struct BrokenDirectory;

    #[async_trait]
    impl HostDirectory for BrokenDirectory {
        async fn get_host(&self, _: i64) -> Result<Option<HostInfo>> {
            Err(Error::Database("hosts table unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_aborted_operation_leaves_cluster_in_error() {
        let h = Harness::new().await;
        let cluster_id = h.cluster_with_hosts(&[1]).await;

        let orchestrator = OperationOrchestrator::new(
            h.registry.clone(),
            Arc::new(BrokenDirectory),
            AgentGateway::new(Some(Arc::new(FakeDispatcher::always_ok())), Duration::from_secs(1)),
            HealthAggregator::new(Duration::from_secs(30)),
            h.locks.clone(),
        );

        let err = orchestrator.start(cluster_id).await.unwrap_err();
        assert!(matches!(err, Error::Database(_)));
        assert!(!h.locks.is_locked(cluster_id));

        let cluster = h.registry.get_cluster(cluster_id).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Error);
        assert_eq!(h.registry.delete_cluster(cluster_id).await.unwrap(), 1);
    }

    struct CountingDispatcher {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl AgentDispatcher for CountingDispatcher {
        async fn send(&self, _: &str, _: CommandType, _: CommandParams) -> Result<CommandReply> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(CommandReply::ok("done"))
        }
    }

    #[tokio::test]
    async fn test_fan_out_is_bounded() {
        let h = Harness::new().await;
        let ids: Vec<i64> = (1..=6).collect();
        for &id in &ids {
            h.online_host(id, HostCategory::BareMetal).await;
        }
        let cluster_id = h.cluster_with_hosts(&ids).await;

        let counter = Arc::new(CountingDispatcher {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        });
        let result = h
            .orchestrator(Some(counter.clone()))
            .with_max_parallel(2)
            .start(cluster_id)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.node_results.len(), 6);
        assert!(counter.peak.load(Ordering::SeqCst) <= 2);
    }
}
