//! Service health and readiness probes
//!
//! Reports on the control plane itself (database, agent gateway, installer),
//! not on the engine clusters it manages.

use serde::{Deserialize, Serialize};
use std::time::Instant;

use crate::agent::AgentGateway;

/// Overall system health status
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Functional, but some operations degrade
    Degraded,
    Unhealthy,
}

/// Individual component health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: i64,
    pub components: Vec<ComponentHealth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub reason: Option<String>,
    pub timestamp: i64,
}

/// Health checker for system components
pub struct HealthChecker {
    start_time: Instant,
    version: String,
}

impl HealthChecker {
    pub fn new(version: &str) -> Self {
        Self {
            start_time: Instant::now(),
            version: version.to_string(),
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn liveness(&self) -> LivenessResponse {
        LivenessResponse {
            alive: true,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub async fn check_database(&self, db: &crate::db::Database) -> ComponentHealth {
        let start = Instant::now();

        match db.health_check().await {
            Ok(_) => ComponentHealth {
                name: "database".to_string(),
                status: HealthStatus::Healthy,
                message: Some("Connected".to_string()),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
            Err(e) => ComponentHealth {
                name: "database".to_string(),
                status: HealthStatus::Unhealthy,
                message: Some(format!("Connection failed: {}", e)),
                latency_ms: Some(start.elapsed().as_millis() as u64),
            },
        }
    }

    /// Without a dispatcher lifecycle commands are only queued
    pub fn check_agent_gateway(&self, gateway: &AgentGateway) -> ComponentHealth {
        let (status, message) = if gateway.is_configured() {
            (HealthStatus::Healthy, "Dispatcher configured")
        } else {
            (
                HealthStatus::Degraded,
                "No dispatcher; lifecycle commands are queued and probes skipped",
            )
        };

        ComponentHealth {
            name: "agent_gateway".to_string(),
            status,
            message: Some(message.to_string()),
            latency_ms: None,
        }
    }

    pub fn check_installer(&self, configured: bool) -> ComponentHealth {
        ComponentHealth {
            name: "installer".to_string(),
            status: if configured {
                HealthStatus::Healthy
            } else {
                HealthStatus::Degraded
            },
            message: Some(if configured {
                "Installer configured".to_string()
            } else {
                "No installer; deployments cannot run".to_string()
            }),
            latency_ms: None,
        }
    }

    fn aggregate_status(components: &[ComponentHealth]) -> HealthStatus {
        if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn build_response(&self, components: Vec<ComponentHealth>) -> HealthResponse {
        HealthResponse {
            status: Self::aggregate_status(&components),
            version: self.version.clone(),
            uptime_seconds: self.uptime_seconds(),
            timestamp: chrono::Utc::now().timestamp(),
            components,
        }
    }

    /// Ready iff the database answers
    pub fn readiness(&self, components: &[ComponentHealth]) -> ReadinessResponse {
        let db_healthy = components
            .iter()
            .find(|c| c.name == "database")
            .map(|c| c.status == HealthStatus::Healthy)
            .unwrap_or(false);

        ReadinessResponse {
            ready: db_healthy,
            reason: (!db_healthy).then(|| "Database not ready".to_string()),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}
