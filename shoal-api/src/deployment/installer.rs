//! Installer boundary
//!
//! The installer unpacks and configures the engine on a host. We only start an
//! installation and poll it until it stops running.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shoal_common::{DeploymentMode, Error, NodeRole, Result};
use std::time::Duration;

/// Everything the installer needs to lay down one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    pub cluster_id: i64,
    pub cluster_name: String,
    pub deployment_mode: DeploymentMode,
    pub version: String,
    pub install_dir: String,
    pub host_id: i64,
    pub host_ip: String,
    pub agent_id: String,
    pub role: NodeRole,
    pub membership_port: u16,
    pub api_port: Option<u16>,
    pub worker_port: Option<u16>,
    /// Addresses of every master-capable node, for membership configuration
    pub master_addresses: Vec<String>,
    pub worker_addresses: Vec<String>,
    pub config: serde_json::Value,
    pub plugins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallHandle {
    pub install_id: String,
}

/// One granular installer sub-step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallStep {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallStatus {
    pub running: bool,
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub steps: Vec<InstallStep>,
}

#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(&self, request: &InstallRequest) -> Result<InstallHandle>;

    async fn status(&self, install_id: &str) -> Result<InstallStatus>;
}

/// Client for an installer service speaking JSON over HTTP
pub struct HttpInstaller {
    base_url: String,
    client: reqwest::Client,
}

impl HttpInstaller {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::System(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn read<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Installer(format!("{}: {}", status, body)));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| Error::Installer(format!("Invalid installer response: {}", e)))
    }
}

#[async_trait]
impl Installer for HttpInstaller {
    async fn install(&self, request: &InstallRequest) -> Result<InstallHandle> {
        let response = self
            .client
            .post(format!("{}/installations", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Installer(format!("Install request failed: {}", e)))?;

        Self::read(response).await
    }

    async fn status(&self, install_id: &str) -> Result<InstallStatus> {
        let response = self
            .client
            .get(format!("{}/installations/{}", self.base_url, install_id))
            .send()
            .await
            .map_err(|e| Error::Installer(format!("Status request failed: {}", e)))?;

        Self::read(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::Path,
        routing::{get, post},
        Json, Router,
    };

    #[tokio::test]
    async fn test_http_installer_install_and_poll() {
        let app = Router::new()
            .route(
                "/installations",
                post(|Json(req): Json<InstallRequest>| async move {
                    Json(InstallHandle {
                        install_id: format!("inst-{}", req.host_id),
                    })
                }),
            )
            .route(
                "/installations/:id",
                get(|Path(id): Path<String>| async move {
                    Json(InstallStatus {
                        running: false,
                        success: true,
                        message: format!("{} done", id),
                        steps: vec![InstallStep {
                            name: "unpack".to_string(),
                            status: "done".to_string(),
                            message: String::new(),
                        }],
                    })
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let installer = HttpInstaller::new(format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        let handle = installer
            .install(&InstallRequest {
                cluster_id: 1,
                cluster_name: "demo".to_string(),
                deployment_mode: DeploymentMode::Hybrid,
                version: "2.3.8".to_string(),
                install_dir: "/opt/engine".to_string(),
                host_id: 4,
                host_ip: "10.0.0.4".to_string(),
                agent_id: "agent-4".to_string(),
                role: NodeRole::MasterWorker,
                membership_port: 5801,
                api_port: Some(8080),
                worker_port: Some(5802),
                master_addresses: vec!["10.0.0.4".to_string()],
                worker_addresses: vec!["10.0.0.4".to_string()],
                config: serde_json::json!({}),
                plugins: Vec::new(),
            })
            .await
            .unwrap();
        assert_eq!(handle.install_id, "inst-4");

        let status = installer.status(&handle.install_id).await.unwrap();
        assert!(!status.running);
        assert!(status.success);
        assert_eq!(status.message, "inst-4 done");
        assert_eq!(status.steps.len(), 1);
    }
}
