///! Agent command dispatch
///!
///! Every remote action goes through `AgentDispatcher::send`. The gateway adds
///! the per-call timeout and turns a missing dispatcher into an explicit
///! `Dispatch::Unconfigured` outcome that callers degrade on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shoal_common::{Error, Operation, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Commands understood by the per-host agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Start,
    Stop,
    Restart,
    CheckPort,
    CheckDirectory,
    CheckHttp,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::CheckPort => "check_port",
            Self::CheckDirectory => "check_directory",
            Self::CheckHttp => "check_http",
        }
    }
}

impl From<Operation> for CommandType {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Start => Self::Start,
            Operation::Stop => Self::Stop,
            Operation::Restart => Self::Restart,
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// String-keyed command parameters; ordered so payloads are stable
pub type CommandParams = BTreeMap<String, String>;

/// Agent's answer to one command
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandReply {
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

impl CommandReply {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Transport to host agents, keyed by the opaque agent identifier
#[async_trait]
pub trait AgentDispatcher: Send + Sync {
    async fn send(
        &self,
        agent_id: &str,
        command: CommandType,
        params: CommandParams,
    ) -> Result<CommandReply>;
}

/// Outcome of a gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Sent(CommandReply),
    /// No dispatcher is configured; nothing was sent
    Unconfigured,
}

/// Optional dispatcher plus per-call timeout
#[derive(Clone)]
pub struct AgentGateway {
    dispatcher: Option<Arc<dyn AgentDispatcher>>,
    timeout: Duration,
}

impl AgentGateway {
    pub fn new(dispatcher: Option<Arc<dyn AgentDispatcher>>, timeout: Duration) -> Self {
        Self {
            dispatcher,
            timeout,
        }
    }

    pub fn unconfigured() -> Self {
        Self::new(None, Duration::from_secs(30))
    }

    pub fn is_configured(&self) -> bool {
        self.dispatcher.is_some()
    }

    pub async fn send(
        &self,
        agent_id: &str,
        command: CommandType,
        params: CommandParams,
    ) -> Result<Dispatch> {
        let Some(dispatcher) = &self.dispatcher else {
            return Ok(Dispatch::Unconfigured);
        };

        debug!(agent_id, command = %command, "Dispatching agent command");

        match tokio::time::timeout(self.timeout, dispatcher.send(agent_id, command, params)).await
        {
            Ok(reply) => reply.map(Dispatch::Sent),
            Err(_) => {
                warn!(agent_id, command = %command, "Agent command timed out");
                Err(Error::Timeout(format!(
                    "{} on agent {} after {}s",
                    command,
                    agent_id,
                    self.timeout.as_secs()
                )))
            }
        }
    }
}

#[derive(Serialize)]
struct CommandEnvelope<'a> {
    command_type: CommandType,
    params: &'a CommandParams,
}

/// Dispatcher that relays commands through an HTTP agent gateway
pub struct HttpAgentDispatcher {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAgentDispatcher {
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
}

#[async_trait]
impl AgentDispatcher for HttpAgentDispatcher {
    async fn send(
        &self,
        agent_id: &str,
        command: CommandType,
        params: CommandParams,
    ) -> Result<CommandReply> {
        let url = format!("{}/agents/{}/commands", self.base_url, agent_id);
        let response = self
            .client
            .post(&url)
            .json(&CommandEnvelope {
                command_type: command,
                params: &params,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("{} on agent {}", command, agent_id))
                } else {
                    Error::Dispatch(format!("{} on agent {}: {}", command, agent_id, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Dispatch(format!(
                "Agent gateway returned {} for {} on {}",
                status, command, agent_id
            )));
        }

        response
            .json::<CommandReply>()
            .await
            .map_err(|e| Error::Dispatch(format!("Invalid agent reply: {}", e)))
    }
}
