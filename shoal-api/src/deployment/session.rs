//! Deployment session state
//!
//! A session walks `basic → hosts → config → precheck → plugins → deploy →
//! complete`; `failed` hangs off `deploy`. Guards live on the session so the
//! manager only has to orchestrate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shoal_common::{DeploymentMode, Error, NodeRole, PrecheckResult, Result};
use uuid::Uuid;

use crate::precheck::{HostPrecheckStatus, PrecheckRequest};
use crate::validation::{validate_cluster_name, validate_install_dir, validate_port, validate_role};

pub const DEFAULT_MEMBERSHIP_PORT: u32 = 5801;
pub const DEFAULT_WORKER_MEMBERSHIP_PORT: u32 = 5802;
pub const DEFAULT_API_PORT: u32 = 8080;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStep {
    Basic,
    Hosts,
    Config,
    Precheck,
    Plugins,
    Deploy,
    Complete,
    Failed,
}

impl DeploymentStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Hosts => "hosts",
            Self::Config => "config",
            Self::Precheck => "precheck",
            Self::Plugins => "plugins",
            Self::Deploy => "deploy",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    /// Step data may be edited only before deployment or after it failed
    pub fn is_editable(&self) -> bool {
        !matches!(self, Self::Deploy | Self::Complete)
    }

    pub fn previous(&self) -> Option<Self> {
        match self {
            Self::Hosts => Some(Self::Basic),
            Self::Config => Some(Self::Hosts),
            Self::Precheck => Some(Self::Config),
            Self::Plugins => Some(Self::Precheck),
            Self::Failed => Some(Self::Plugins),
            Self::Basic | Self::Deploy | Self::Complete => None,
        }
    }
}

impl std::fmt::Display for DeploymentStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicInfo {
    pub cluster_name: String,
    pub deployment_mode: DeploymentMode,
    #[serde(default)]
    pub description: String,
}

impl Default for BasicInfo {
    fn default() -> Self {
        Self {
            cluster_name: String::new(),
            deployment_mode: DeploymentMode::Hybrid,
            description: String::new(),
        }
    }
}

/// A host picked for the new cluster
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSelection {
    pub host_id: i64,
    /// Hybrid clusters default to `master/worker`
    #[serde(default)]
    pub role: Option<NodeRole>,
    #[serde(default)]
    pub membership_port: Option<u32>,
    #[serde(default)]
    pub api_port: Option<u32>,
    #[serde(default)]
    pub worker_port: Option<u32>,
}

/// Host selection with role and ports filled in
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectedHost {
    pub host_id: i64,
    pub role: NodeRole,
    pub membership_port: u32,
    pub api_port: Option<u32>,
    pub worker_port: Option<u32>,
}

impl SelectedHost {
    pub fn precheck_request(&self, install_dir: &str) -> PrecheckRequest {
        PrecheckRequest {
            host_id: self.host_id,
            role: self.role,
            install_dir: Some(install_dir.to_string()).filter(|d| !d.is_empty()),
            membership_port: self.membership_port,
            api_port: self.api_port,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigInfo {
    pub version: String,
    #[serde(default)]
    pub install_dir: String,
    #[serde(default)]
    pub config: Option<serde_json::Value>,
}

/// Precheck outcome for one host in one role
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPrecheck {
    pub host_id: i64,
    pub role: NodeRole,
    pub status: HostPrecheckStatus,
    pub result: PrecheckResult,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostDeployStatus {
    Pending,
    Installing,
    Succeeded,
    Failed,
    Skipped,
}

/// Per-host deployment progress with every collected sub-step message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProgress {
    pub host_id: i64,
    pub host_ip: Option<String>,
    pub role: NodeRole,
    pub status: HostDeployStatus,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployProgress {
    /// Set once per session, reused by retries
    pub cluster_id: Option<i64>,
    pub attempts: u32,
    pub hosts: Vec<HostProgress>,
    pub messages: Vec<String>,
    pub error: Option<String>,
    pub cancel_requested: bool,
}

impl DeployProgress {
    pub fn host_mut(&mut self, host_id: i64, role: NodeRole) -> Option<&mut HostProgress> {
        self.hosts
            .iter_mut()
            .find(|h| h.host_id == host_id && h.role == role)
    }
}

/// Server-side deployment workflow state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSession {
    pub id: Uuid,
    pub step: DeploymentStep,
    pub basic: BasicInfo,
    pub hosts: Vec<SelectedHost>,
    pub config: ConfigInfo,
    /// Latest precheck per selected host and role
    pub precheck: Vec<HostPrecheck>,
    pub plugins: Vec<String>,
    pub deploy: DeployProgress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentSession {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            step: DeploymentStep::Basic,
            basic: BasicInfo::default(),
            hosts: Vec::new(),
            config: ConfigInfo::default(),
            precheck: Vec::new(),
            plugins: Vec::new(),
            deploy: DeployProgress::default(),
            created_at: now,
            updated_at: now,
        }
    }

    fn ensure_editable(&self) -> Result<()> {
        if !self.step.is_editable() {
            return Err(Error::InvalidTransition(format!(
                "Deployment {} is in step '{}' and can no longer be edited",
                self.id, self.step
            )));
        }
        Ok(())
    }

    pub fn set_basic(&mut self, basic: BasicInfo) -> Result<()> {
        self.ensure_editable()?;
        if self.deploy.cluster_id.is_some()
            && (basic.cluster_name.trim() != self.basic.cluster_name
                || basic.deployment_mode != self.basic.deployment_mode)
        {
            return Err(Error::InvalidTransition(
                "Cluster name and mode are fixed once the cluster has been created".to_string(),
            ));
        }
        if basic.deployment_mode != self.basic.deployment_mode {
            // roles and default ports depend on the mode
            self.hosts.clear();
            self.precheck.clear();
        }
        self.basic = BasicInfo {
            cluster_name: basic.cluster_name.trim().to_string(),
            ..basic
        };
        self.touch();
        Ok(())
    }

    pub fn set_hosts(&mut self, selections: Vec<HostSelection>) -> Result<()> {
        self.ensure_editable()?;
        let mode = self.basic.deployment_mode;

        let mut hosts: Vec<SelectedHost> = Vec::with_capacity(selections.len());
        for selection in selections {
            let host = resolve_selection(mode, selection)?;
            if hosts
                .iter()
                .any(|h| h.host_id == host.host_id && h.role == host.role)
            {
                return Err(Error::Validation(format!(
                    "Host {} selected twice as {}",
                    host.host_id, host.role
                )));
            }
            hosts.push(host);
        }

        self.hosts = hosts;
        self.precheck.clear();
        self.touch();
        Ok(())
    }

    pub fn set_config(&mut self, config: ConfigInfo) -> Result<()> {
        self.ensure_editable()?;
        validate_install_dir(&config.install_dir)?;
        self.config = ConfigInfo {
            version: config.version.trim().to_string(),
            ..config
        };
        self.precheck.clear();
        self.touch();
        Ok(())
    }

    pub fn set_plugins(&mut self, plugins: Vec<String>) -> Result<()> {
        self.ensure_editable()?;
        let mut plugins: Vec<String> = plugins
            .into_iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        plugins.sort();
        plugins.dedup();
        self.plugins = plugins;
        self.touch();
        Ok(())
    }

    /// Guard for leaving the current step forward
    pub fn check_advance(&self) -> Result<DeploymentStep> {
        match self.step {
            DeploymentStep::Basic => {
                validate_cluster_name(&self.basic.cluster_name)?;
                Ok(DeploymentStep::Hosts)
            }
            DeploymentStep::Hosts => {
                if self.hosts.is_empty() {
                    return Err(Error::Validation("Select at least one host".to_string()));
                }
                let mode = self.basic.deployment_mode;
                if let Some(host) = self.hosts.iter().find(|h| !h.role.allowed_in(mode)) {
                    return Err(Error::Validation(format!(
                        "Role '{}' of host {} is not allowed in {} mode",
                        host.role, host.host_id, mode
                    )));
                }
                if mode == DeploymentMode::Separated {
                    let masters = self
                        .hosts
                        .iter()
                        .filter(|h| h.role == NodeRole::Master)
                        .count();
                    let workers = self
                        .hosts
                        .iter()
                        .filter(|h| h.role == NodeRole::Worker)
                        .count();
                    if masters == 0 || workers == 0 {
                        return Err(Error::Validation(
                            "Separated mode needs at least one master and one worker".to_string(),
                        ));
                    }
                }
                Ok(DeploymentStep::Config)
            }
            DeploymentStep::Config => {
                if self.config.version.is_empty() {
                    return Err(Error::Validation("Select an engine version".to_string()));
                }
                Ok(DeploymentStep::Precheck)
            }
            DeploymentStep::Precheck => {
                let blocked: Vec<String> = self
                    .hosts
                    .iter()
                    .filter(|h| {
                        !self
                            .precheck_for(h.host_id, h.role)
                            .is_some_and(|p| p.status.allows_advance())
                    })
                    .map(|h| format!("{} ({})", h.host_id, h.role))
                    .collect();
                if !blocked.is_empty() {
                    return Err(Error::Validation(format!(
                        "Precheck has not passed for host(s): {}",
                        blocked.join(", ")
                    )));
                }
                Ok(DeploymentStep::Plugins)
            }
            DeploymentStep::Plugins => Ok(DeploymentStep::Deploy),
            DeploymentStep::Deploy | DeploymentStep::Complete | DeploymentStep::Failed => {
                Err(Error::InvalidTransition(format!(
                    "Cannot advance from step '{}'",
                    self.step
                )))
            }
        }
    }

    pub fn precheck_for(&self, host_id: i64, role: NodeRole) -> Option<&HostPrecheck> {
        self.precheck
            .iter()
            .find(|p| p.host_id == host_id && p.role == role)
    }

    /// Store a precheck outcome, replacing the previous one for the same host and role
    pub fn record_precheck(&mut self, outcome: HostPrecheck) {
        self.precheck
            .retain(|p| !(p.host_id == outcome.host_id && p.role == outcome.role));
        self.precheck.push(outcome);
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl Default for DeploymentSession {
    fn default() -> Self {
        Self::new()
    }
}

fn resolve_selection(mode: DeploymentMode, selection: HostSelection) -> Result<SelectedHost> {
    let role = match (selection.role, mode) {
        (Some(role), _) => role,
        (None, DeploymentMode::Hybrid) => NodeRole::MasterWorker,
        (None, DeploymentMode::Separated) => {
            return Err(Error::Validation(format!(
                "Host {} needs a role in separated mode",
                selection.host_id
            )))
        }
    };
    validate_role(mode, role)?;

    let default_membership = if role == NodeRole::Worker {
        DEFAULT_WORKER_MEMBERSHIP_PORT
    } else {
        DEFAULT_MEMBERSHIP_PORT
    };
    let membership_port = selection.membership_port.unwrap_or(default_membership);
    validate_port("membership_port", membership_port)?;

    let api_port = if role.is_master() {
        Some(selection.api_port.unwrap_or(DEFAULT_API_PORT))
    } else {
        None
    };
    let worker_port = if role.is_master() && mode == DeploymentMode::Hybrid {
        Some(selection.worker_port.unwrap_or(DEFAULT_WORKER_MEMBERSHIP_PORT))
    } else {
        None
    };
    for (field, port) in [("api_port", api_port), ("worker_port", worker_port)] {
        if let Some(port) = port {
            validate_port(field, port)?;
        }
    }

    Ok(SelectedHost {
        host_id: selection.host_id,
        role,
        membership_port,
        api_port,
        worker_port,
    })
}
