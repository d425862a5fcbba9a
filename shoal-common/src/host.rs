///! Managed host facts as reported by the host directory

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::{Error, Result};

/// Host category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostCategory {
    BareMetal, // physical machine or VM, managed through an agent
    Container, // containerized host, lifecycle may be self-managed
}

impl HostCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BareMetal => "bare_metal",
            Self::Container => "container",
        }
    }

    /// Lifecycle commands on this category need a live agent
    pub fn requires_agent(&self) -> bool {
        matches!(self, Self::BareMetal)
    }
}

impl FromStr for HostCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bare_metal" | "vm" => Ok(Self::BareMetal),
            "container" | "docker" => Ok(Self::Container),
            other => Err(Error::Validation(format!("Invalid host category: {}", other))),
        }
    }
}

/// Agent install status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    NotInstalled,
    Installing,
    Installed,
    Uninstalling,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Uninstalling => "uninstalling",
            Self::Error => "error",
        }
    }
}

impl FromStr for AgentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_installed" => Ok(Self::NotInstalled),
            "installing" => Ok(Self::Installing),
            "installed" => Ok(Self::Installed),
            "uninstalling" => Ok(Self::Uninstalling),
            "error" => Ok(Self::Error),
            other => Err(Error::Validation(format!("Invalid agent status: {}", other))),
        }
    }
}

/// Host facts the control plane consumes but never writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostInfo {
    pub id: i64,
    pub name: String,
    pub category: HostCategory,
    pub ip_address: String,
    pub agent_id: String,
    pub agent_status: AgentStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl HostInfo {
    pub fn agent_installed(&self) -> bool {
        self.agent_status == AgentStatus::Installed
    }
}
