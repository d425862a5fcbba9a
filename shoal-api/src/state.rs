//! Application State
//!
//! Shared state for the Shoal API server

use shoal_common::Result;
use std::sync::Arc;

use crate::agent::{AgentDispatcher, AgentGateway, HttpAgentDispatcher};
use crate::cluster::{ClusterLocks, ClusterService, HealthAggregator, OperationOrchestrator};
use crate::config::ShoalConfig;
use crate::db::Database;
use crate::deployment::{DeploymentManager, DeploymentSettings, HttpInstaller, Installer};
use crate::health::HealthChecker;
use crate::hosts::{DbHostDirectory, HostDirectory};
use crate::logs::LogCollector;
use crate::precheck::PrecheckEngine;
use crate::registry::Registry;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ShoalConfig>,
    pub database: Arc<Database>,
    pub registry: Registry,
    pub directory: Arc<dyn HostDirectory>,
    pub clusters: ClusterService,
    pub health: HealthAggregator,
    pub gateway: AgentGateway,
    pub precheck: Arc<PrecheckEngine>,
    pub orchestrator: OperationOrchestrator,
    pub deployments: DeploymentManager,
    pub log_collector: Option<Arc<dyn LogCollector>>,
    pub checker: Arc<HealthChecker>,
    pub installer_configured: bool,
}

impl AppState {
    /// Wire every component from explicit collaborators
    pub fn new(
        config: ShoalConfig,
        database: Arc<Database>,
        directory: Arc<dyn HostDirectory>,
        dispatcher: Option<Arc<dyn AgentDispatcher>>,
        installer: Option<Arc<dyn Installer>>,
        log_collector: Option<Arc<dyn LogCollector>>,
    ) -> Self {
        let registry = Registry::new(database.pool().clone());
        let locks = ClusterLocks::new();
        let health = HealthAggregator::new(config.health.heartbeat_timeout());
        let gateway = AgentGateway::new(dispatcher, config.agent.command_timeout());

        let clusters = ClusterService::new(registry.clone(), directory.clone(), locks.clone());
        let precheck = Arc::new(PrecheckEngine::new(
            registry.clone(),
            directory.clone(),
            gateway.clone(),
            health,
            config.precheck.clone(),
        ));
        let orchestrator = OperationOrchestrator::new(
            registry.clone(),
            directory.clone(),
            gateway.clone(),
            health,
            locks,
        )
        .with_max_parallel(config.orchestrator.max_parallel);

        let installer_configured = installer.is_some();
        let deployments = DeploymentManager::new(
            registry.clone(),
            clusters.clone(),
            directory.clone(),
            precheck.clone(),
            installer,
            DeploymentSettings {
                poll_interval: config.deployment.poll_interval(),
                install_timeout: config.deployment.install_timeout(),
            },
        );

        Self {
            config: Arc::new(config),
            database,
            registry,
            directory,
            clusters,
            health,
            gateway,
            precheck,
            orchestrator,
            deployments,
            log_collector,
            checker: Arc::new(HealthChecker::new(env!("CARGO_PKG_VERSION"))),
            installer_configured,
        }
    }

    /// Production wiring: hosts table directory, HTTP dispatcher and installer when configured
    pub fn from_config(config: ShoalConfig, database: Arc<Database>) -> Result<Self> {
        let directory: Arc<dyn HostDirectory> =
            Arc::new(DbHostDirectory::new(database.pool().clone()));

        let dispatcher: Option<Arc<dyn AgentDispatcher>> = match &config.agent.gateway_url {
            Some(url) => {
                tracing::info!("Agent commands dispatched through {}", url);
                Some(Arc::new(HttpAgentDispatcher::new(
                    url.clone(),
                    config.agent.command_timeout(),
                )?))
            }
            None => {
                tracing::warn!("No agent gateway configured, lifecycle commands will be queued");
                None
            }
        };

        let installer: Option<Arc<dyn Installer>> = match &config.installer.base_url {
            Some(url) => Some(Arc::new(HttpInstaller::new(
                url.clone(),
                config.agent.command_timeout(),
            )?)),
            None => {
                tracing::warn!("No installer configured, deployments are disabled");
                None
            }
        };

        Ok(Self::new(config, database, directory, dispatcher, installer, None))
    }
}
