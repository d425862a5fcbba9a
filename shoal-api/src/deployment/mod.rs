///! Deployment workflow
///!
///! Provisions a new cluster end-to-end: collects the basic info, hosts, config
///! and plugins step by step, prechecks every host, then creates the cluster,
///! admits the nodes and drives the installer host by host.

pub mod installer;
pub mod session;

use shoal_common::{ClusterStatus, Error, HostInfo, NodeRole, NodeStatus, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cluster::ClusterService;
use crate::hosts::HostDirectory;
use crate::precheck::{HostPrecheckStatus, PrecheckEngine};
use crate::registry::{CreateClusterRequest, NewNode, Registry};

pub use installer::{HttpInstaller, InstallHandle, InstallRequest, InstallStatus, InstallStep, Installer};
pub use session::{
    BasicInfo, ConfigInfo, DeploymentSession, DeploymentStep, HostDeployStatus, HostPrecheck,
    HostProgress, HostSelection,
};

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CancelOutcome {
    /// The session was dropped
    Discarded,
    /// A deployment is in flight; no further installs will be issued
    Cancelling,
}

#[derive(Debug, Clone, Copy)]
pub struct DeploymentSettings {
    pub poll_interval: Duration,
    pub install_timeout: Duration,
}

impl Default for DeploymentSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(2000),
            install_timeout: Duration::from_secs(1800),
        }
    }
}

/// Owns all deployment sessions and runs their deploy tasks
#[derive(Clone)]
pub struct DeploymentManager {
    sessions: Arc<RwLock<HashMap<Uuid, DeploymentSession>>>,
    cancels: Arc<RwLock<HashMap<Uuid, watch::Sender<bool>>>>,
    registry: Registry,
    clusters: ClusterService,
    directory: Arc<dyn HostDirectory>,
    precheck: Arc<PrecheckEngine>,
    installer: Option<Arc<dyn Installer>>,
    settings: DeploymentSettings,
}

impl DeploymentManager {
    pub fn new(
        registry: Registry,
        clusters: ClusterService,
        directory: Arc<dyn HostDirectory>,
        precheck: Arc<PrecheckEngine>,
        installer: Option<Arc<dyn Installer>>,
        settings: DeploymentSettings,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            cancels: Arc::new(RwLock::new(HashMap::new())),
            registry,
            clusters,
            directory,
            precheck,
            installer,
            settings,
        }
    }

    pub async fn create_session(&self) -> DeploymentSession {
        let session = DeploymentSession::new();
        self.sessions.write().await.insert(session.id, session.clone());
        info!(workflow_id = %session.id, "Deployment session created");
        session
    }

    pub async fn get_session(&self, id: Uuid) -> Result<DeploymentSession> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::WorkflowNotFound(id.to_string()))
    }

    pub async fn list_sessions(&self) -> Vec<DeploymentSession> {
        let mut sessions: Vec<DeploymentSession> =
            self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.created_at);
        sessions
    }

    async fn with_session<T>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut DeploymentSession) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| Error::WorkflowNotFound(id.to_string()))?;
        f(session)
    }

    pub async fn update_basic(&self, id: Uuid, basic: BasicInfo) -> Result<DeploymentSession> {
        self.with_session(id, |s| {
            s.set_basic(basic)?;
            Ok(s.clone())
        })
        .await
    }

    pub async fn update_hosts(
        &self,
        id: Uuid,
        hosts: Vec<HostSelection>,
    ) -> Result<DeploymentSession> {
        self.with_session(id, |s| {
            s.set_hosts(hosts)?;
            Ok(s.clone())
        })
        .await
    }

    pub async fn update_config(&self, id: Uuid, config: ConfigInfo) -> Result<DeploymentSession> {
        self.with_session(id, |s| {
            s.set_config(config)?;
            Ok(s.clone())
        })
        .await
    }

    pub async fn update_plugins(&self, id: Uuid, plugins: Vec<String>) -> Result<DeploymentSession> {
        self.with_session(id, |s| {
            s.set_plugins(plugins)?;
            Ok(s.clone())
        })
        .await
    }

    /// Precheck every selected host and record the latest verdicts
    pub async fn run_precheck(&self, id: Uuid) -> Result<DeploymentSession> {
        let snapshot = self.get_session(id).await?;
        if !snapshot.step.is_editable() {
            return Err(Error::InvalidTransition(format!(
                "Cannot precheck during step '{}'",
                snapshot.step
            )));
        }
        if snapshot.hosts.is_empty() {
            return Err(Error::Validation("No hosts selected".to_string()));
        }

        // Sessions are not locked while probes run
        let install_dir = snapshot.config.install_dir.as_str();
        let checks = snapshot.hosts.iter().map(|host| async move {
            let request = host.precheck_request(install_dir);
            let result = self.precheck.check_candidate(&request, install_dir).await?;
            Ok::<_, Error>((host.host_id, host.role, result))
        });
        let results = futures::future::join_all(checks)
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        self.with_session(id, |s| {
            if s.hosts != snapshot.hosts || s.config.install_dir != snapshot.config.install_dir {
                return Err(Error::InvalidTransition(
                    "Hosts or config changed during precheck, run it again".to_string(),
                ));
            }
            for (host_id, role, result) in results {
                let status = HostPrecheckStatus::from_result(&result);
                s.record_precheck(HostPrecheck {
                    host_id,
                    role,
                    status,
                    result,
                });
            }
            s.touch();
            Ok(s.clone())
        })
        .await
    }

    /// Guarded forward transition; leaving `plugins` starts the deployment
    pub async fn advance(&self, id: Uuid) -> Result<DeploymentSession> {
        let session = self.get_session(id).await?;
        if session.step == DeploymentStep::Plugins {
            return self.deploy(id).await;
        }

        self.with_session(id, |s| {
            let next = s.check_advance()?;
            info!(workflow_id = %id, from = %s.step, to = %next, "Deployment step advanced");
            s.step = next;
            s.touch();
            Ok(s.clone())
        })
        .await
    }

    pub async fn back(&self, id: Uuid) -> Result<DeploymentSession> {
        self.with_session(id, |s| {
            let previous = s.step.previous().ok_or_else(|| {
                Error::InvalidTransition(format!("Cannot go back from step '{}'", s.step))
            })?;
            s.step = previous;
            s.touch();
            Ok(s.clone())
        })
        .await
    }

    /// Enter `deploy` from `plugins` and start execution
    pub async fn deploy(&self, id: Uuid) -> Result<DeploymentSession> {
        self.start_execution(id, DeploymentStep::Plugins).await
    }

    /// Re-run a failed deployment, reusing the cluster it already created
    pub async fn retry(&self, id: Uuid) -> Result<DeploymentSession> {
        self.start_execution(id, DeploymentStep::Failed).await
    }

    pub async fn cancel(&self, id: Uuid, confirm: bool) -> Result<CancelOutcome> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| Error::WorkflowNotFound(id.to_string()))?;

        if session.step == DeploymentStep::Deploy {
            if !confirm {
                return Err(Error::Validation(
                    "Deployment is in progress and may already have created a cluster; \
                     cancel again with confirm=true"
                        .to_string(),
                ));
            }
            session.deploy.cancel_requested = true;
            session.touch();
            if let Some(tx) = self.cancels.read().await.get(&id) {
                let _ = tx.send(true);
            }
            warn!(workflow_id = %id, "Deployment cancel requested");
            return Ok(CancelOutcome::Cancelling);
        }

        sessions.remove(&id);
        info!(workflow_id = %id, "Deployment session discarded");
        Ok(CancelOutcome::Discarded)
    }

    async fn start_execution(&self, id: Uuid, from: DeploymentStep) -> Result<DeploymentSession> {
        let installer = self
            .installer
            .clone()
            .ok_or_else(|| Error::Installer("No installer configured".to_string()))?;

        // Registered before entering `deploy` so a cancel can never miss it
        let (tx, rx) = watch::channel(false);
        let previous = self.cancels.write().await.insert(id, tx);
        let entered = self
            .with_session(id, |s| {
                if s.step != from {
                    return Err(Error::InvalidTransition(format!(
                        "Deployment can only start from step '{}', session is at '{}'",
                        from, s.step
                    )));
                }
                s.step = DeploymentStep::Deploy;
                s.deploy.attempts += 1;
                s.deploy.error = None;
                s.deploy.cancel_requested = false;
                s.deploy.hosts = s
                    .hosts
                    .iter()
                    .map(|h| HostProgress {
                        host_id: h.host_id,
                        host_ip: None,
                        role: h.role,
                        status: HostDeployStatus::Pending,
                        messages: Vec::new(),
                    })
                    .collect();
                s.touch();
                Ok(s.clone())
            })
            .await;

        let session = match entered {
            Ok(session) => session,
            Err(e) => {
                let mut cancels = self.cancels.write().await;
                match previous {
                    Some(tx) => cancels.insert(id, tx),
                    None => cancels.remove(&id),
                };
                return Err(e);
            }
        };

        info!(workflow_id = %id, attempt = session.deploy.attempts, "Deployment started");

        let manager = self.clone();
        tokio::spawn(async move {
            manager.execute(id, installer, rx).await;
        });

        Ok(session)
    }

    async fn execute(self, id: Uuid, installer: Arc<dyn Installer>, cancel: watch::Receiver<bool>) {
        let outcome = self.run_deployment(id, installer.as_ref(), &cancel).await;
        self.cancels.write().await.remove(&id);

        match outcome {
            Ok(()) => {
                let _ = self
                    .with_session(id, |s| {
                        s.step = DeploymentStep::Complete;
                        s.deploy.messages.push("Deployment complete".to_string());
                        s.touch();
                        Ok(())
                    })
                    .await;
                info!(workflow_id = %id, "Deployment complete");
            }
            Err(e) => {
                error!(workflow_id = %id, "Deployment failed: {}", e);
                let _ = self
                    .with_session(id, |s| {
                        s.step = DeploymentStep::Failed;
                        s.deploy.messages.push(format!("Deployment failed: {}", e));
                        s.deploy.error = Some(e.to_string());
                        for host in s.deploy.hosts.iter_mut() {
                            if host.status == HostDeployStatus::Pending {
                                host.status = HostDeployStatus::Skipped;
                            }
                        }
                        s.touch();
                        Ok(())
                    })
                    .await;
            }
        }
    }

    async fn run_deployment(
        &self,
        id: Uuid,
        installer: &dyn Installer,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let session = self.get_session(id).await?;
        let cluster_id = self.ensure_cluster(&session).await?;

        // Held until the final cluster status is written
        let _guard = self.clusters.locks().try_acquire(cluster_id)?;

        let outcome = async {
            self.registry
                .update_cluster_status(cluster_id, ClusterStatus::Deploying)
                .await?;
            self.install_cluster(id, cluster_id, &session, installer, cancel)
                .await
        }
        .await;

        let status = if outcome.is_ok() {
            ClusterStatus::Running
        } else {
            ClusterStatus::Error
        };
        if let Err(e) = self.registry.update_cluster_status(cluster_id, status).await {
            error!(workflow_id = %id, cluster_id, status = %status, "Failed to settle cluster status: {}", e);
            return outcome.and(Err(e));
        }
        outcome
    }

    /// Admit the nodes and install host by host
    async fn install_cluster(
        &self,
        id: Uuid,
        cluster_id: i64,
        session: &DeploymentSession,
        installer: &dyn Installer,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        // Resolve every host up front; the installer needs all member addresses
        let host_ids: Vec<i64> = session.hosts.iter().map(|h| h.host_id).collect();
        let hosts = self.directory.get_hosts(&host_ids).await?;

        let mut master_addresses = Vec::new();
        let mut worker_addresses = Vec::new();
        for selected in &session.hosts {
            let ip = resolve(&hosts, selected.host_id)?.ip_address.clone();
            if selected.role.is_master() && !master_addresses.contains(&ip) {
                master_addresses.push(ip.clone());
            }
            if selected.role.is_worker() && !worker_addresses.contains(&ip) {
                worker_addresses.push(ip);
            }
        }

        // Admit every node; nodes from an earlier attempt are reused
        let mut node_ids: HashMap<(i64, NodeRole), i64> = HashMap::new();
        for selected in &session.hosts {
            let request = NewNode {
                host_id: selected.host_id,
                role: selected.role,
                install_dir: None,
                membership_port: selected.membership_port,
                api_port: selected.api_port,
                worker_port: selected.worker_port,
            };
            let node_id = match self.clusters.add_node(cluster_id, request).await {
                Ok(node) => node.id,
                Err(Error::NodeAlreadyExists { .. }) => self
                    .registry
                    .list_nodes(cluster_id)
                    .await?
                    .into_iter()
                    .find(|n| n.host_id == selected.host_id && n.role == selected.role)
                    .map(|n| n.id)
                    .ok_or_else(|| Error::System("Existing node vanished".to_string()))?,
                Err(e) => return Err(e),
            };
            node_ids.insert((selected.host_id, selected.role), node_id);
        }

        for selected in &session.hosts {
            if *cancel.borrow() {
                return Err(Error::System("Deployment cancelled".to_string()));
            }

            let host = resolve(&hosts, selected.host_id)?;
            let node_id = node_ids
                .get(&(selected.host_id, selected.role))
                .copied()
                .ok_or_else(|| Error::System("Node missing after admission".to_string()))?;

            self.registry
                .update_node_status(node_id, NodeStatus::Installing, None)
                .await?;
            self.update_host(id, selected.host_id, selected.role, |p| {
                p.host_ip = Some(host.ip_address.clone());
                p.status = HostDeployStatus::Installing;
            })
            .await;

            let request = InstallRequest {
                cluster_id,
                cluster_name: session.basic.cluster_name.clone(),
                deployment_mode: session.basic.deployment_mode,
                version: session.config.version.clone(),
                install_dir: session.config.install_dir.clone(),
                host_id: host.id,
                host_ip: host.ip_address.clone(),
                agent_id: host.agent_id.clone(),
                role: selected.role,
                membership_port: selected.membership_port as u16,
                api_port: selected.api_port.map(|p| p as u16),
                worker_port: selected.worker_port.map(|p| p as u16),
                master_addresses: master_addresses.clone(),
                worker_addresses: worker_addresses.clone(),
                config: session.config.config.clone().unwrap_or_else(|| serde_json::json!({})),
                plugins: session.plugins.clone(),
            };

            match self.install_host(id, installer, &request, cancel).await {
                Ok(()) => {
                    self.registry
                        .update_node_status(node_id, NodeStatus::Running, None)
                        .await?;
                    self.update_host(id, selected.host_id, selected.role, |p| {
                        p.status = HostDeployStatus::Succeeded;
                    })
                    .await;
                }
                Err(e) => {
                    if let Err(persist) = self
                        .registry
                        .update_node_status(node_id, NodeStatus::Error, None)
                        .await
                    {
                        error!(node_id, "Failed to mark node errored: {}", persist);
                    }
                    let message = e.to_string();
                    self.update_host(id, selected.host_id, selected.role, |p| {
                        p.status = HostDeployStatus::Failed;
                        p.messages.push(message);
                    })
                    .await;
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Create the cluster once per session
    async fn ensure_cluster(&self, session: &DeploymentSession) -> Result<i64> {
        if let Some(cluster_id) = session.deploy.cluster_id {
            // Must still exist; a retry never re-creates
            self.registry.get_cluster(cluster_id).await?;
            return Ok(cluster_id);
        }

        let cluster = self
            .registry
            .create_cluster(CreateClusterRequest {
                name: session.basic.cluster_name.clone(),
                description: session.basic.description.clone(),
                deployment_mode: session.basic.deployment_mode,
                version: session.config.version.clone(),
                config: session.config.config.clone(),
                install_dir: session.config.install_dir.clone(),
            })
            .await?;

        self.with_session(session.id, |s| {
            s.deploy.cluster_id = Some(cluster.id);
            s.deploy
                .messages
                .push(format!("Created cluster '{}' ({})", cluster.name, cluster.id));
            Ok(())
        })
        .await?;

        Ok(cluster.id)
    }

    /// Start one installation and poll it until it stops running or the
    /// deployment is cancelled
    async fn install_host(
        &self,
        id: Uuid,
        installer: &dyn Installer,
        request: &InstallRequest,
        cancel: &watch::Receiver<bool>,
    ) -> Result<()> {
        let handle = installer.install(request).await?;
        info!(workflow_id = %id, host_id = request.host_id, install_id = %handle.install_id, "Installation started");

        let poll = async {
            let mut seen_steps = 0;
            loop {
                tokio::time::sleep(self.settings.poll_interval).await;
                let status = installer.status(&handle.install_id).await?;

                if status.steps.len() > seen_steps {
                    let new: Vec<String> = status.steps[seen_steps..]
                        .iter()
                        .map(|s| {
                            if s.message.is_empty() {
                                format!("{}: {}", s.name, s.status)
                            } else {
                                format!("{}: {} ({})", s.name, s.status, s.message)
                            }
                        })
                        .collect();
                    seen_steps = status.steps.len();
                    self.update_host(id, request.host_id, request.role, |p| {
                        p.messages.extend(new);
                    })
                    .await;
                }

                if !status.running {
                    return Ok::<InstallStatus, Error>(status);
                }
            }
        };

        let status = tokio::select! {
            polled = tokio::time::timeout(self.settings.install_timeout, poll) => {
                polled.map_err(|_| {
                    Error::Timeout(format!(
                        "Installation on host {} did not finish within {}s",
                        request.host_id,
                        self.settings.install_timeout.as_secs()
                    ))
                })??
            }
            _ = cancelled(cancel.clone()) => {
                warn!(workflow_id = %id, host_id = request.host_id, install_id = %handle.install_id, "Stopped waiting for installation");
                return Err(Error::System(format!(
                    "Deployment cancelled while installing on host {}",
                    request.host_id
                )));
            }
        };

        if status.success {
            Ok(())
        } else {
            Err(Error::Installer(format!(
                "Installation on host {} failed: {}",
                request.host_id, status.message
            )))
        }
    }

    async fn update_host(
        &self,
        id: Uuid,
        host_id: i64,
        role: NodeRole,
        f: impl FnOnce(&mut HostProgress),
    ) {
        let _ = self
            .with_session(id, |s| {
                if let Some(progress) = s.deploy.host_mut(host_id, role) {
                    f(progress);
                }
                s.touch();
                Ok(())
            })
            .await;
    }
}

fn resolve(hosts: &HashMap<i64, HostInfo>, host_id: i64) -> Result<&HostInfo> {
    hosts.get(&host_id).ok_or(Error::HostNotFound(host_id))
}

/// Resolves once a cancel is signalled; pends forever if the sender is gone
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::FakeDispatcher;
    use crate::agent::{AgentDispatcher, AgentGateway, CommandReply, CommandType};
    use crate::cluster::{ClusterLocks, HealthAggregator, OperationOrchestrator};
    use crate::config::PrecheckConfig;
    use crate::db::Database;
    use crate::hosts::InMemoryHostDirectory;
    use async_trait::async_trait;
    use chrono::Utc;
    use shoal_common::{AgentStatus, DeploymentMode, HostCategory};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Installer that finishes after two polls; hosts in `failing` fail
    #[derive(Default)]
    struct FakeInstaller {
        failing: Mutex<Vec<i64>>,
        installs: Mutex<Vec<InstallRequest>>,
        polls: AtomicUsize,
    }

    #[async_trait]
    impl Installer for FakeInstaller {
        async fn install(&self, request: &InstallRequest) -> Result<InstallHandle> {
            self.installs.lock().unwrap().push(request.clone());
            Ok(InstallHandle {
                install_id: request.host_id.to_string(),
            })
        }

        async fn status(&self, install_id: &str) -> Result<InstallStatus> {
            let poll = self.polls.fetch_add(1, Ordering::SeqCst);
            let host_id: i64 = install_id.parse().unwrap();
            let failing = self.failing.lock().unwrap().contains(&host_id);
            let mut steps = vec![InstallStep {
                name: "download".to_string(),
                status: "done".to_string(),
                message: String::new(),
            }];
            if poll % 2 == 0 {
                return Ok(InstallStatus {
                    running: true,
                    success: false,
                    message: String::new(),
                    steps,
                });
            }
            steps.push(InstallStep {
                name: "configure".to_string(),
                status: if failing { "failed" } else { "done" }.to_string(),
                message: String::new(),
            });
            Ok(InstallStatus {
                running: false,
                success: !failing,
                message: if failing { "disk full".to_string() } else { String::new() },
                steps,
            })
        }
    }

    /// Installer whose installations never finish
    struct HangingInstaller;

    #[async_trait]
    impl Installer for HangingInstaller {
        async fn install(&self, request: &InstallRequest) -> Result<InstallHandle> {
            Ok(InstallHandle {
                install_id: request.host_id.to_string(),
            })
        }

        async fn status(&self, _: &str) -> Result<InstallStatus> {
            Ok(InstallStatus {
                running: true,
                success: false,
                message: String::new(),
                steps: Vec::new(),
            })
        }
    }

    struct Harness {
        manager: DeploymentManager,
        registry: Registry,
        directory: Arc<dyn HostDirectory>,
        locks: ClusterLocks,
        installer: Arc<FakeInstaller>,
    }

    async fn harness(with_installer: bool) -> Harness {
        let fake = Arc::new(FakeInstaller::default());
        let installer = with_installer.then(|| fake.clone() as Arc<dyn Installer>);
        build(fake, installer, None, Duration::from_secs(5)).await
    }

    async fn build(
        fake: Arc<FakeInstaller>,
        installer: Option<Arc<dyn Installer>>,
        dispatcher: Option<Arc<dyn AgentDispatcher>>,
        install_timeout: Duration,
    ) -> Harness {
        let db = Database::in_memory().await.unwrap();
        db.migrate().await.unwrap();
        let registry = Registry::new(db.pool().clone());

        let directory = InMemoryHostDirectory::new();
        for id in 1..=3 {
            directory
                .upsert(HostInfo {
                    id,
                    name: format!("host-{}", id),
                    category: HostCategory::BareMetal,
                    ip_address: format!("10.0.0.{}", id),
                    agent_id: format!("agent-{}", id),
                    agent_status: AgentStatus::Installed,
                    last_heartbeat: Some(Utc::now()),
                })
                .await;
        }
        let directory: Arc<dyn HostDirectory> = Arc::new(directory);

        let health = HealthAggregator::new(Duration::from_secs(30));
        let gateway = AgentGateway::new(dispatcher, Duration::from_secs(1));
        let precheck = Arc::new(PrecheckEngine::new(
            registry.clone(),
            directory.clone(),
            gateway,
            health,
            PrecheckConfig::default(),
        ));
        let locks = ClusterLocks::new();
        let clusters = ClusterService::new(registry.clone(), directory.clone(), locks.clone());

        let manager = DeploymentManager::new(
            registry.clone(),
            clusters,
            directory.clone(),
            precheck,
            installer,
            DeploymentSettings {
                poll_interval: Duration::from_millis(5),
                install_timeout,
            },
        );

        Harness {
            manager,
            registry,
            directory,
            locks,
            installer: fake,
        }
    }

    fn hybrid_host(host_id: i64) -> HostSelection {
        HostSelection {
            host_id,
            role: None,
            membership_port: None,
            api_port: None,
            worker_port: None,
        }
    }

    /// Walk a session up to the plugins step
    async fn prepared_session(h: &Harness, hosts: Vec<HostSelection>) -> Uuid {
        let m = &h.manager;
        let id = m.create_session().await.id;
        m.update_basic(
            id,
            BasicInfo {
                cluster_name: "fleet".to_string(),
                deployment_mode: DeploymentMode::Hybrid,
                description: String::new(),
            },
        )
        .await
        .unwrap();
        m.advance(id).await.unwrap();
        m.update_hosts(id, hosts).await.unwrap();
        m.advance(id).await.unwrap();
        m.update_config(
            id,
            ConfigInfo {
                version: "2.3.8".to_string(),
                install_dir: "/opt/engine".to_string(),
                config: None,
            },
        )
        .await
        .unwrap();
        m.advance(id).await.unwrap();
        m.run_precheck(id).await.unwrap();
        let session = m.advance(id).await.unwrap();
        assert_eq!(session.step, DeploymentStep::Plugins);
        id
    }

    async fn wait_until_settled(m: &DeploymentManager, id: Uuid) -> DeploymentSession {
        for _ in 0..400 {
            let session = m.get_session(id).await.unwrap();
            if session.step != DeploymentStep::Deploy {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("deployment did not settle");
    }

    /// Wait until the first host is being installed; returns the cluster id
    async fn wait_until_installing(m: &DeploymentManager, id: Uuid) -> i64 {
        for _ in 0..200 {
            let session = m.get_session(id).await.unwrap();
            if session.deploy.hosts[0].status == HostDeployStatus::Installing {
                return session.deploy.cluster_id.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("installation never started");
    }

    #[tokio::test]
    async fn test_full_deployment_completes() {
        let h = harness(true).await;
        let id = prepared_session(&h, vec![hybrid_host(1), hybrid_host(2)]).await;

        let session = h.manager.get_session(id).await.unwrap();
        // No dispatcher: probes skipped, verdict is warning
        assert!(session
            .precheck
            .iter()
            .all(|p| p.status == HostPrecheckStatus::Warning));

        h.manager.deploy(id).await.unwrap();
        let session = wait_until_settled(&h.manager, id).await;
        assert_eq!(session.step, DeploymentStep::Complete);

        let cluster_id = session.deploy.cluster_id.unwrap();
        let (cluster, nodes) = h.registry.get_cluster_with_nodes(cluster_id).await.unwrap();
        assert_eq!(cluster.status, ClusterStatus::Running);
        assert_eq!(nodes.len(), 2);
        assert!(nodes.iter().all(|n| n.status == NodeStatus::Running));

        let installs = h.installer.installs.lock().unwrap();
        assert_eq!(installs.len(), 2);
        assert_eq!(installs[0].master_addresses, vec!["10.0.0.1", "10.0.0.2"]);
        drop(installs);

        assert!(session.deploy.hosts[0]
            .messages
            .iter()
            .any(|m| m.starts_with("configure")));
    }

    #[tokio::test]
    async fn test_failure_aborts_then_retry_reuses_cluster() {
        let h = harness(true).await;
        h.installer.failing.lock().unwrap().push(1);
        let id = prepared_session(&h, vec![hybrid_host(1), hybrid_host(2)]).await;

        h.manager.advance(id).await.unwrap();
        let session = wait_until_settled(&h.manager, id).await;
        assert_eq!(session.step, DeploymentStep::Failed);
        assert_eq!(session.deploy.hosts[0].status, HostDeployStatus::Failed);
        assert_eq!(session.deploy.hosts[1].status, HostDeployStatus::Skipped);
        assert!(session.deploy.error.as_deref().unwrap().contains("disk full"));
        assert_eq!(h.installer.installs.lock().unwrap().len(), 1);

        let cluster_id = session.deploy.cluster_id.unwrap();
        assert_eq!(
            h.registry.get_cluster(cluster_id).await.unwrap().status,
            ClusterStatus::Error
        );

        h.installer.failing.lock().unwrap().clear();
        h.manager.retry(id).await.unwrap();
        let session = wait_until_settled(&h.manager, id).await;
        assert_eq!(session.step, DeploymentStep::Complete);
        assert_eq!(session.deploy.cluster_id, Some(cluster_id));
        assert_eq!(session.deploy.attempts, 2);

        let page = h.registry.list_clusters(&Default::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(h.registry.list_nodes(cluster_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_back_from_failed_returns_to_plugins() {
        let h = harness(true).await;
        h.installer.failing.lock().unwrap().push(1);
        let id = prepared_session(&h, vec![hybrid_host(1)]).await;

        h.manager.deploy(id).await.unwrap();
        wait_until_settled(&h.manager, id).await;

        let session = h.manager.back(id).await.unwrap();
        assert_eq!(session.step, DeploymentStep::Plugins);
        assert!(session.deploy.cluster_id.is_some());
    }

    #[tokio::test]
    async fn test_precheck_required_before_plugins() {
        let h = harness(true).await;
        let m = &h.manager;
        let id = m.create_session().await.id;
        m.update_basic(
            id,
            BasicInfo {
                cluster_name: "fleet".to_string(),
                deployment_mode: DeploymentMode::Hybrid,
                description: String::new(),
            },
        )
        .await
        .unwrap();
        m.advance(id).await.unwrap();
        // host 9 is unknown to the directory
        m.update_hosts(id, vec![hybrid_host(1), hybrid_host(9)]).await.unwrap();
        m.advance(id).await.unwrap();
        m.update_config(
            id,
            ConfigInfo {
                version: "2.3.8".to_string(),
                install_dir: String::new(),
                config: None,
            },
        )
        .await
        .unwrap();
        m.advance(id).await.unwrap();

        assert!(matches!(m.advance(id).await, Err(Error::Validation(_))));

        let session = m.run_precheck(id).await.unwrap();
        assert_eq!(
            session.precheck_for(9, NodeRole::MasterWorker).unwrap().status,
            HostPrecheckStatus::Failed
        );
        assert!(m.advance(id).await.is_err());
        assert_eq!(m.get_session(id).await.unwrap().step, DeploymentStep::Precheck);
    }

    #[tokio::test]
    async fn test_deploy_requires_installer_and_plugins_step() {
        let h = harness(false).await;
        let id = prepared_session(&h, vec![hybrid_host(1)]).await;
        assert!(matches!(h.manager.deploy(id).await, Err(Error::Installer(_))));

        let h = harness(true).await;
        let id = h.manager.create_session().await.id;
        assert!(matches!(
            h.manager.deploy(id).await,
            Err(Error::InvalidTransition(_))
        ));
        assert!(matches!(
            h.manager.retry(id).await,
            Err(Error::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_semantics() {
        let h = harness(true).await;
        let id = prepared_session(&h, vec![hybrid_host(1), hybrid_host(2), hybrid_host(3)]).await;

        h.manager.deploy(id).await.unwrap();
        assert!(matches!(h.manager.cancel(id, false).await, Err(Error::Validation(_))));
        assert_eq!(h.manager.cancel(id, true).await.unwrap(), CancelOutcome::Cancelling);

        let session = wait_until_settled(&h.manager, id).await;
        assert_eq!(session.step, DeploymentStep::Failed);
        assert!(session.deploy.cancel_requested);
        assert!(h.installer.installs.lock().unwrap().len() < 3);

        assert_eq!(h.manager.cancel(id, false).await.unwrap(), CancelOutcome::Discarded);
        assert!(matches!(
            h.manager.get_session(id).await,
            Err(Error::WorkflowNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_master_precheck_blocks_shared_host() {
        let dispatcher = Arc::new(FakeDispatcher::new(|_, command, params| {
            if command == CommandType::CheckPort && params["port"] == "5801" {
                Ok(CommandReply::failed("port 5801 in use"))
            } else {
                Ok(CommandReply::ok("ok"))
            }
        }));
        let h = build(
            Arc::new(FakeInstaller::default()),
            None,
            Some(dispatcher),
            Duration::from_secs(5),
        )
        .await;
        let m = &h.manager;

        let id = m.create_session().await.id;
        m.update_basic(
            id,
            BasicInfo {
                cluster_name: "fleet".to_string(),
                deployment_mode: DeploymentMode::Separated,
                description: String::new(),
            },
        )
        .await
        .unwrap();
        m.advance(id).await.unwrap();
        let on_host_1 = |role| HostSelection {
            role: Some(role),
            ..hybrid_host(1)
        };
        m.update_hosts(id, vec![on_host_1(NodeRole::Master), on_host_1(NodeRole::Worker)])
            .await
            .unwrap();
        m.advance(id).await.unwrap();
        m.update_config(
            id,
            ConfigInfo {
                version: "2.3.8".to_string(),
                install_dir: "/opt/engine".to_string(),
                config: None,
            },
        )
        .await
        .unwrap();
        m.advance(id).await.unwrap();

        let session = m.run_precheck(id).await.unwrap();
        assert_eq!(session.precheck.len(), 2);
        assert_eq!(
            session.precheck_for(1, NodeRole::Master).unwrap().status,
            HostPrecheckStatus::Failed
        );
        assert_eq!(
            session.precheck_for(1, NodeRole::Worker).unwrap().status,
            HostPrecheckStatus::Passed
        );

        assert!(matches!(m.advance(id).await, Err(Error::Validation(_))));
        assert_eq!(m.get_session(id).await.unwrap().step, DeploymentStep::Precheck);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_running_installation() {
        let h = build(
            Arc::new(FakeInstaller::default()),
            Some(Arc::new(HangingInstaller)),
            None,
            Duration::from_secs(600),
        )
        .await;
        let id = prepared_session(&h, vec![hybrid_host(1), hybrid_host(2)]).await;

        h.manager.deploy(id).await.unwrap();
        let cluster_id = wait_until_installing(&h.manager, id).await;

        let requested = std::time::Instant::now();
        h.manager.cancel(id, true).await.unwrap();
        let session = wait_until_settled(&h.manager, id).await;
        assert!(requested.elapsed() < Duration::from_secs(2));

        assert_eq!(session.step, DeploymentStep::Failed);
        assert!(session.deploy.error.as_deref().unwrap().contains("cancelled"));
        assert_eq!(session.deploy.hosts[0].status, HostDeployStatus::Failed);
        assert_eq!(session.deploy.hosts[1].status, HostDeployStatus::Skipped);
        assert_eq!(
            h.registry.get_cluster(cluster_id).await.unwrap().status,
            ClusterStatus::Error
        );
    }

    #[tokio::test]
    async fn test_deployment_holds_cluster_lock() {
        let h = build(
            Arc::new(FakeInstaller::default()),
            Some(Arc::new(HangingInstaller)),
            None,
            Duration::from_secs(600),
        )
        .await;
        let id = prepared_session(&h, vec![hybrid_host(1)]).await;

        h.manager.deploy(id).await.unwrap();
        let cluster_id = wait_until_installing(&h.manager, id).await;

        let orchestrator = OperationOrchestrator::new(
            h.registry.clone(),
            h.directory.clone(),
            AgentGateway::unconfigured(),
            HealthAggregator::new(Duration::from_secs(30)),
            h.locks.clone(),
        );
        assert!(matches!(
            orchestrator.start(cluster_id).await,
            Err(Error::OperationInProgress(_))
        ));
        assert_eq!(
            h.registry.get_cluster(cluster_id).await.unwrap().status,
            ClusterStatus::Deploying
        );

        h.manager.cancel(id, true).await.unwrap();
        wait_until_settled(&h.manager, id).await;
        assert!(!h.locks.is_locked(cluster_id));
        assert!(orchestrator.stop(cluster_id).await.is_ok());
    }
}
