//! Common test utilities and helpers
//!
//! Each test gets its own server on an ephemeral port, backed by an
//! in-memory database and an in-memory host directory.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use shoal_api::agent::{AgentDispatcher, CommandParams, CommandReply, CommandType};
use shoal_api::config::ShoalConfig;
use shoal_api::db::Database;
use shoal_api::deployment::{InstallHandle, InstallRequest, InstallStatus, InstallStep, Installer};
use shoal_api::hosts::InMemoryHostDirectory;
use shoal_api::{api, AppState};
use shoal_common::{AgentStatus, HostCategory, HostInfo, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;

/// Agent dispatcher that records every command and always succeeds
#[derive(Default)]
pub struct RecordingDispatcher {
    pub calls: Mutex<Vec<(String, CommandType)>>,
}

impl RecordingDispatcher {
    pub fn commands(&self) -> Vec<CommandType> {
        self.calls.lock().unwrap().iter().map(|(_, c)| *c).collect()
    }
}

#[async_trait]
impl AgentDispatcher for RecordingDispatcher {
    async fn send(
        &self,
        agent_id: &str,
        command: CommandType,
        _params: CommandParams,
    ) -> Result<CommandReply> {
        self.calls.lock().unwrap().push((agent_id.to_string(), command));
        Ok(CommandReply::ok(format!("{} accepted", command)))
    }
}

/// Installer that completes every install on the first status poll
pub struct InstantInstaller {
    pub failing_hosts: Vec<i64>,
    pub requests: Mutex<Vec<InstallRequest>>,
}

impl InstantInstaller {
    pub fn new(failing_hosts: Vec<i64>) -> Self {
        Self {
            failing_hosts,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Installer for InstantInstaller {
    async fn install(&self, request: &InstallRequest) -> Result<InstallHandle> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(InstallHandle {
            install_id: format!("install-{}", request.host_id),
        })
    }

    async fn status(&self, install_id: &str) -> Result<InstallStatus> {
        let host_id: i64 = install_id
            .trim_start_matches("install-")
            .parse()
            .unwrap_or_default();
        let success = !self.failing_hosts.contains(&host_id);

        Ok(InstallStatus {
            running: false,
            success,
            message: if success {
                "installed".to_string()
            } else {
                "disk full".to_string()
            },
            steps: vec![InstallStep {
                name: "unpack".to_string(),
                status: if success { "done" } else { "failed" }.to_string(),
                message: String::new(),
            }],
        })
    }
}

/// Test environment setup
pub struct TestEnv {
    pub client: Client,
    pub base_url: String,
    pub hosts: InMemoryHostDirectory,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub state: Arc<AppState>,
}

pub struct TestEnvBuilder {
    dispatcher: bool,
    installer: Option<Arc<dyn Installer>>,
}

impl TestEnvBuilder {
    pub fn without_dispatcher(mut self) -> Self {
        self.dispatcher = false;
        self
    }

    pub fn with_installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub async fn start(self) -> TestEnv {
        let mut config = ShoalConfig::default();
        config.deployment.poll_interval_ms = 10;
        config.deployment.install_timeout_secs = 5;

        let database = Database::in_memory().await.expect("in-memory database");
        database.migrate().await.expect("migrations");

        let hosts = InMemoryHostDirectory::new();
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let dyn_dispatcher: Option<Arc<dyn AgentDispatcher>> = if self.dispatcher {
            Some(dispatcher.clone())
        } else {
            None
        };

        let state = Arc::new(AppState::new(
            config,
            Arc::new(database),
            Arc::new(hosts.clone()),
            dyn_dispatcher,
            self.installer,
            None,
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let app = api::router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("server");
        });

        TestEnv {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("Failed to create HTTP client"),
            base_url: format!("http://{}/api", addr),
            hosts,
            dispatcher,
            state,
        }
    }
}

impl TestEnv {
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder {
            dispatcher: true,
            installer: None,
        }
    }

    pub async fn start() -> Self {
        Self::builder().start().await
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get(&self, path: &str) -> Response {
        self.client.get(self.url(path)).send().await.expect("GET failed")
    }

    pub async fn post(&self, path: &str, body: Value) -> Response {
        self.client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("POST failed")
    }

    pub async fn post_empty(&self, path: &str) -> Response {
        self.client.post(self.url(path)).send().await.expect("POST failed")
    }

    pub async fn put(&self, path: &str, body: Value) -> Response {
        self.client
            .put(self.url(path))
            .json(&body)
            .send()
            .await
            .expect("PUT failed")
    }

    pub async fn delete(&self, path: &str) -> Response {
        self.client.delete(self.url(path)).send().await.expect("DELETE failed")
    }

    /// Register a bare-metal host with an installed agent and a fresh heartbeat
    pub async fn add_online_host(&self, id: i64, ip: &str) {
        self.hosts.upsert(host(id, ip, Some(Utc::now()))).await;
    }

    /// Push the host's last heartbeat well outside the online window
    pub async fn make_stale(&self, id: i64) {
        let stale = Utc::now() - ChronoDuration::hours(1);
        self.hosts.record_heartbeat(id, stale).await.expect("heartbeat");
    }
}

pub fn host(id: i64, ip: &str, last_heartbeat: Option<chrono::DateTime<Utc>>) -> HostInfo {
    HostInfo {
        id,
        name: format!("host-{}", id),
        category: HostCategory::BareMetal,
        ip_address: ip.to_string(),
        agent_id: format!("agent-{}", id),
        agent_status: AgentStatus::Installed,
        last_heartbeat,
    }
}

/// Assert the status code and return the parsed body
pub async fn expect_status(response: Response, status: StatusCode) -> Value {
    let actual = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    assert_eq!(actual, status, "unexpected status, body: {}", body);
    body
}

/// Retry operation until it yields a value or attempts run out
pub async fn retry_until_success<F, Fut, T>(
    mut operation: F,
    max_attempts: u32,
    delay_ms: u64,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for attempt in 0..max_attempts {
        if let Some(result) = operation().await {
            return Some(result);
        }
        if attempt < max_attempts - 1 {
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }
    None
}
