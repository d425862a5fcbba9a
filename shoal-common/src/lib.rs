//! Common types and utilities shared between shoal-api and its clients

pub mod host;

pub use host::{AgentStatus, HostCategory, HostInfo};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// How masters and workers are laid out across the cluster's nodes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    Hybrid,    // every node runs master and worker together
    Separated, // dedicated master nodes and worker nodes
}

impl DeploymentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Separated => "separated",
        }
    }
}

impl FromStr for DeploymentMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "hybrid" => Ok(Self::Hybrid),
            "separated" => Ok(Self::Separated),
            other => Err(Error::Validation(format!("Invalid deployment mode: {}", other))),
        }
    }
}

impl std::fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    #[default]
    Created,
    Deploying,
    Running,
    Stopped,
    Error,
}

impl ClusterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Deploying => "deploying",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }

    /// Clusters in these states have live processes or an in-flight rollout
    pub fn blocks_deletion(&self) -> bool {
        matches!(self, Self::Running | Self::Deploying)
    }
}

impl FromStr for ClusterStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(Self::Created),
            "deploying" => Ok(Self::Deploying),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(Error::Validation(format!("Invalid cluster status: {}", other))),
        }
    }
}

impl std::fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a node plays in the engine cluster
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum NodeRole {
    #[serde(rename = "master")]
    Master,
    #[serde(rename = "worker")]
    Worker,
    #[serde(rename = "master/worker")]
    MasterWorker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Worker => "worker",
            Self::MasterWorker => "master/worker",
        }
    }

    /// Master-capable roles expose the HTTP API port
    pub fn is_master(&self) -> bool {
        matches!(self, Self::Master | Self::MasterWorker)
    }

    pub fn is_worker(&self) -> bool {
        matches!(self, Self::Worker | Self::MasterWorker)
    }

    /// Whether the role may be used in a cluster of the given mode
    pub fn allowed_in(&self, mode: DeploymentMode) -> bool {
        match mode {
            DeploymentMode::Hybrid => true,
            DeploymentMode::Separated => !matches!(self, Self::MasterWorker),
        }
    }
}

impl FromStr for NodeRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "master" => Ok(Self::Master),
            "worker" => Ok(Self::Worker),
            "master/worker" | "hybrid" => Ok(Self::MasterWorker),
            other => Err(Error::Validation(format!("Invalid node role: {}", other))),
        }
    }
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Pending,
    Installing,
    Running,
    Stopped,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Installing => "installing",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl FromStr for NodeStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "installing" => Ok(Self::Installing),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error" => Ok(Self::Error),
            other => Err(Error::Validation(format!("Invalid node status: {}", other))),
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named engine cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub deployment_mode: DeploymentMode,
    pub version: String,
    #[serde(default)]
    pub config: serde_json::Value,
    pub status: ClusterStatus,
    pub install_dir: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One engine process bound to a host and a role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i64,
    pub cluster_id: i64,
    pub host_id: i64,
    pub role: NodeRole,
    pub install_dir: String,
    pub membership_port: u16,
    pub api_port: Option<u16>,
    pub worker_port: Option<u16>,
    pub status: NodeStatus,
    pub process_id: Option<i64>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Derived cluster health, never persisted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Per-node liveness as seen through its host's heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusInfo {
    pub node_id: i64,
    pub host_id: i64,
    pub host_name: Option<String>,
    pub host_ip: Option<String>,
    pub role: NodeRole,
    pub status: NodeStatus,
    pub is_online: bool,
}

/// Cluster status with derived health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterStatusInfo {
    pub cluster_id: i64,
    pub cluster_name: String,
    pub status: ClusterStatus,
    pub health: ClusterHealth,
    pub total_nodes: usize,
    pub online_nodes: usize,
    pub offline_nodes: usize,
    pub nodes: Vec<NodeStatusInfo>,
}

/// Cluster-wide lifecycle operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
    Restart,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }

    /// Status every node and the cluster settle in when the operation succeeds
    pub fn target_cluster_status(&self) -> ClusterStatus {
        match self {
            Self::Start | Self::Restart => ClusterStatus::Running,
            Self::Stop => ClusterStatus::Stopped,
        }
    }

    pub fn target_node_status(&self) -> NodeStatus {
        match self {
            Self::Start | Self::Restart => NodeStatus::Running,
            Self::Stop => NodeStatus::Stopped,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome for a single node of a cluster-wide operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeOperationResult {
    pub node_id: i64,
    pub host_id: i64,
    pub host_name: Option<String>,
    pub host_ip: Option<String>,
    pub success: bool,
    pub message: String,
}

/// Aggregate outcome of a cluster-wide operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub cluster_id: i64,
    pub operation: Operation,
    pub success: bool,
    pub message: String,
    pub node_results: Vec<NodeOperationResult>,
}

/// Tri-state outcome of a single precheck item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Passed,
    Failed,
    Skipped,
}

/// One named readiness probe result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecheckItem {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

/// Ordered result of a precheck run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecheckResult {
    pub success: bool,
    pub message: String,
    pub items: Vec<PrecheckItem>,
}

impl PrecheckResult {
    pub fn has_skipped(&self) -> bool {
        self.items.iter().any(|i| i.status == CheckStatus::Skipped)
    }
}

/// API error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cluster not found: {0}")]
    ClusterNotFound(i64),

    #[error("Node not found: {0}")]
    NodeNotFound(i64),

    #[error("Host not found: {0}")]
    HostNotFound(i64),

    #[error("Deployment workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Cluster name cannot be empty")]
    ClusterNameEmpty,

    #[error("Cluster name already in use: {0}")]
    ClusterNameDuplicate(String),

    #[error("Host {host_id} already holds a {role} node in cluster {cluster_id}")]
    NodeAlreadyExists {
        cluster_id: i64,
        host_id: i64,
        role: NodeRole,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cluster {0} is {1}; stop it before removing it or its nodes")]
    ClusterBusy(i64, ClusterStatus),

    #[error("Another operation is in progress on cluster {0}")]
    OperationInProgress(i64),

    #[error("Agent is not installed on host {0}")]
    AgentNotInstalled(i64),

    #[error("Host {0} is offline")]
    HostOffline(i64),

    #[error("Agent command failed: {0}")]
    Dispatch(String),

    #[error("Installer error: {0}")]
    Installer(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid workflow transition: {0}")]
    InvalidTransition(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("System error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
