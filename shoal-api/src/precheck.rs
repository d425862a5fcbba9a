///! Node admission precheck
///!
///! Ordered readiness probes for a candidate node. An unusable host stops the
///! run after the first item; probes that need an agent are skipped when no
///! dispatcher is configured. Prechecks never write to the registry.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shoal_common::{CheckStatus, HostInfo, NodeRole, PrecheckItem, PrecheckResult, Result};
use std::sync::Arc;
use tracing::{debug, info};

use crate::agent::{AgentGateway, CommandParams, CommandType, Dispatch};
use crate::cluster::HealthAggregator;
use crate::config::PrecheckConfig;
use crate::hosts::HostDirectory;
use crate::registry::Registry;
use crate::validation::{validate_install_dir, validate_port};

pub const CHECK_AGENT_STATUS: &str = "agent_status";
pub const CHECK_PORT: &str = "port_check";
pub const CHECK_DIRECTORY: &str = "directory_check";
pub const CHECK_ENGINE_REST: &str = "engine_rest";

/// Candidate node to validate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrecheckRequest {
    pub host_id: i64,
    pub role: NodeRole,
    /// Defaults to the cluster's install path
    #[serde(default)]
    pub install_dir: Option<String>,
    pub membership_port: u32,
    #[serde(default)]
    pub api_port: Option<u32>,
}

/// Per-host verdict kept by the deployment workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HostPrecheckStatus {
    Passed,
    /// Passed, but some probes were skipped
    Warning,
    Failed,
}

impl HostPrecheckStatus {
    pub fn from_result(result: &PrecheckResult) -> Self {
        if !result.success {
            Self::Failed
        } else if result.has_skipped() {
            Self::Warning
        } else {
            Self::Passed
        }
    }

    pub fn allows_advance(&self) -> bool {
        matches!(self, Self::Passed | Self::Warning)
    }
}

pub struct PrecheckEngine {
    registry: Registry,
    directory: Arc<dyn HostDirectory>,
    gateway: AgentGateway,
    health: HealthAggregator,
    paths: PrecheckConfig,
}

impl PrecheckEngine {
    pub fn new(
        registry: Registry,
        directory: Arc<dyn HostDirectory>,
        gateway: AgentGateway,
        health: HealthAggregator,
        paths: PrecheckConfig,
    ) -> Self {
        Self {
            registry,
            directory,
            gateway,
            health,
            paths,
        }
    }

    /// Precheck a candidate node of an existing cluster
    pub async fn run(&self, cluster_id: i64, request: &PrecheckRequest) -> Result<PrecheckResult> {
        let cluster = self.registry.get_cluster(cluster_id).await?;
        let result = self.check_candidate(request, &cluster.install_dir).await?;
        debug!(cluster_id, host_id = request.host_id, success = result.success, "Precheck finished");
        Ok(result)
    }

    /// Precheck a candidate before any cluster exists, as the deployment workflow does
    pub async fn check_candidate(
        &self,
        request: &PrecheckRequest,
        default_install_dir: &str,
    ) -> Result<PrecheckResult> {
        let membership_port = validate_port("membership_port", request.membership_port)?;
        let api_port = request
            .api_port
            .map(|p| validate_port("api_port", p))
            .transpose()?;
        let install_dir = match request.install_dir.as_deref().filter(|d| !d.is_empty()) {
            Some(dir) => {
                validate_install_dir(dir)?;
                dir.to_string()
            }
            None => default_install_dir.to_string(),
        };

        let host = match self.check_agent(request.host_id).await? {
            Ok(host) => host,
            Err(item) => {
                info!(host_id = request.host_id, "Precheck stopped: {}", item.message);
                return Ok(PrecheckResult {
                    success: false,
                    message: item.message.clone(),
                    items: vec![item],
                });
            }
        };

        let mut items = vec![item(
            CHECK_AGENT_STATUS,
            CheckStatus::Passed,
            format!("Agent on {} is installed and online", host.name),
        )];

        let mut params = CommandParams::new();
        params.insert("port".to_string(), membership_port.to_string());
        params.insert("role".to_string(), request.role.to_string());
        items.push(self.probe(&host, CHECK_PORT, CommandType::CheckPort, params).await);

        let mut params = CommandParams::new();
        params.insert("path".to_string(), install_dir);
        items.push(
            self.probe(&host, CHECK_DIRECTORY, CommandType::CheckDirectory, params)
                .await,
        );

        items.push(self.check_engine_rest(&host, membership_port, api_port).await);

        Ok(summarize(items))
    }

    /// First gate: the host must resolve, have its agent installed and be online
    async fn check_agent(&self, host_id: i64) -> Result<std::result::Result<HostInfo, PrecheckItem>> {
        let Some(host) = self.directory.get_host(host_id).await? else {
            return Ok(Err(item(
                CHECK_AGENT_STATUS,
                CheckStatus::Failed,
                format!("Host {} not found", host_id),
            )));
        };

        if !host.agent_installed() {
            return Ok(Err(item(
                CHECK_AGENT_STATUS,
                CheckStatus::Failed,
                format!(
                    "Agent on {} is {}, install it first",
                    host.name,
                    host.agent_status.as_str()
                ),
            )));
        }

        if !self.health.is_online(&host, Utc::now()) {
            return Ok(Err(item(
                CHECK_AGENT_STATUS,
                CheckStatus::Failed,
                format!("Host {} is offline (no heartbeat within {}s)", host.name, self.health.heartbeat_timeout().as_secs()),
            )));
        }

        Ok(Ok(host))
    }

    async fn probe(
        &self,
        host: &HostInfo,
        name: &str,
        command: CommandType,
        params: CommandParams,
    ) -> PrecheckItem {
        match self.gateway.send(&host.agent_id, command, params).await {
            Ok(Dispatch::Sent(reply)) if reply.success => item(name, CheckStatus::Passed, reply.message),
            Ok(Dispatch::Sent(reply)) => item(name, CheckStatus::Failed, reply.message),
            Ok(Dispatch::Unconfigured) => item(
                name,
                CheckStatus::Skipped,
                "Skipped: no agent dispatcher configured".to_string(),
            ),
            Err(e) => item(name, CheckStatus::Failed, e.to_string()),
        }
    }

    /// Membership-port endpoint first, API-port endpoint as fallback
    async fn check_engine_rest(
        &self,
        host: &HostInfo,
        membership_port: u16,
        api_port: Option<u16>,
    ) -> PrecheckItem {
        let membership_url = format!(
            "http://{}:{}{}",
            host.ip_address, membership_port, self.paths.membership_rest_path
        );
        let first = self
            .probe(host, CHECK_ENGINE_REST, CommandType::CheckHttp, url_params(&membership_url))
            .await;

        if first.status != CheckStatus::Failed {
            return first;
        }

        let Some(api_port) = api_port else {
            return first;
        };

        let api_url = format!(
            "http://{}:{}{}",
            host.ip_address, api_port, self.paths.api_rest_path
        );
        let fallback = self
            .probe(host, CHECK_ENGINE_REST, CommandType::CheckHttp, url_params(&api_url))
            .await;

        if fallback.status == CheckStatus::Passed {
            fallback
        } else {
            item(
                CHECK_ENGINE_REST,
                CheckStatus::Failed,
                format!("{}; API endpoint: {}", first.message, fallback.message),
            )
        }
    }
}

fn url_params(url: &str) -> CommandParams {
    let mut params = CommandParams::new();
    params.insert("url".to_string(), url.to_string());
    params
}

fn item(name: &str, status: CheckStatus, message: String) -> PrecheckItem {
    PrecheckItem {
        name: name.to_string(),
        status,
        message,
    }
}

fn summarize(items: Vec<PrecheckItem>) -> PrecheckResult {
    let failed = items.iter().filter(|i| i.status == CheckStatus::Failed).count();
    let skipped = items.iter().filter(|i| i.status == CheckStatus::Skipped).count();

    let message = match (failed, skipped) {
        (0, 0) => "All checks passed".to_string(),
        (0, s) => format!("Passed with {} skipped check(s)", s),
        (f, _) => format!("{} check(s) failed", f),
    };

    PrecheckResult {
        success: failed == 0,
        message,
        items,
    }
}
