//! Configuration management for the Shoal control plane
//!
//! This module provides a centralized configuration system that loads settings from:
//! 1. Environment variables (highest priority)
//! 2. Configuration file (TOML format)
//! 3. Default values (lowest priority)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration struct for Shoal
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShoalConfig {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Heartbeat-derived health
    pub health: HealthConfig,
    /// Agent command dispatch
    pub agent: AgentConfig,
    /// Cluster-wide operation fan-out
    pub orchestrator: OrchestratorConfig,
    /// Node admission prechecks
    pub precheck: PrecheckConfig,
    /// Deployment workflow
    pub deployment: DeploymentConfig,
    /// External installer service
    pub installer: InstallerConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database URL (e.g., "sqlite:///var/lib/shoal/shoal.db")
    pub url: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Directory for log files
    pub log_dir: PathBuf,
    /// Enable file logging
    pub file_logging_enabled: bool,
    /// Emit console logs as JSON
    pub json_format: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// A host whose last heartbeat is older than this is offline
    pub heartbeat_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the agent command gateway; no dispatcher when unset
    pub gateway_url: Option<String>,
    /// Upper bound on a single command round trip
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Maximum nodes handled concurrently by one operation
    pub max_parallel: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecheckConfig {
    /// REST path served on the membership port
    pub membership_rest_path: String,
    /// REST path served on the master HTTP API port
    pub api_rest_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    /// Installer status poll interval
    pub poll_interval_ms: u64,
    /// Upper bound on one host's installation
    pub install_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    /// Base URL of the installer service; deployments are rejected when unset
    pub base_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8801,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:///var/lib/shoal/shoal.db".to_string(),
            max_connections: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: PathBuf::from("/var/log/shoal"),
            file_logging_enabled: true,
            json_format: false,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 30,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            gateway_url: None,
            command_timeout_secs: 30,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { max_parallel: 8 }
    }
}

impl Default for PrecheckConfig {
    fn default() -> Self {
        Self {
            membership_rest_path: "/hazelcast/rest/maps/overview".to_string(),
            api_rest_path: "/overview".to_string(),
        }
    }
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2000,
            install_timeout_secs: 1800,
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }
}

impl AgentConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl DeploymentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

impl ShoalConfig {
    /// Load configuration from environment variables and optional config file
    pub fn load() -> Self {
        let mut config = Self::default();

        // Try to load from config file first
        if let Some(config_path) = Self::find_config_file() {
            match Self::load_from_file(&config_path) {
                Ok(file_config) => config = file_config,
                Err(e) => tracing::warn!("Ignoring config file: {}", e),
            }
        }

        // Override with environment variables
        config.apply_env_overrides();

        config
    }

    /// Load configuration from a specific file path
    pub fn load_from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::FileRead(path.clone(), e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let paths = [
            // Environment variable override
            std::env::var("SHOAL_CONFIG").ok().map(PathBuf::from),
            // Standard locations
            Some(PathBuf::from("/etc/shoal/config.toml")),
            Some(PathBuf::from("./shoal.toml")),
        ];

        paths.into_iter().flatten().find(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Server
        if let Ok(host) = std::env::var("SHOAL_HOST") {
            self.server.host = host;
        }
        if let Ok(port) = std::env::var("SHOAL_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }

        // Database
        if let Ok(url) = std::env::var("SHOAL_DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(max) = std::env::var("SHOAL_DATABASE_MAX_CONNECTIONS") {
            if let Ok(max) = max.parse() {
                self.database.max_connections = max;
            }
        }

        // Logging
        if let Ok(level) = std::env::var("SHOAL_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(path) = std::env::var("SHOAL_LOG_DIR") {
            self.logging.log_dir = PathBuf::from(path);
        }
        if let Ok(enabled) = std::env::var("SHOAL_FILE_LOGGING") {
            self.logging.file_logging_enabled = enabled.parse().unwrap_or(true);
        }

        // Health
        if let Ok(secs) = std::env::var("SHOAL_HEARTBEAT_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.health.heartbeat_timeout_secs = secs;
            }
        }

        // Agent
        if let Ok(url) = std::env::var("SHOAL_AGENT_GATEWAY_URL") {
            self.agent.gateway_url = Some(url);
        }
        if let Ok(secs) = std::env::var("SHOAL_AGENT_COMMAND_TIMEOUT_SECS") {
            if let Ok(secs) = secs.parse() {
                self.agent.command_timeout_secs = secs;
            }
        }

        // Orchestrator
        if let Ok(max) = std::env::var("SHOAL_MAX_PARALLEL") {
            if let Ok(max) = max.parse() {
                self.orchestrator.max_parallel = max;
            }
        }

        // Installer
        if let Ok(url) = std::env::var("SHOAL_INSTALLER_URL") {
            self.installer.base_url = Some(url);
        }
    }

    /// Generate a sample configuration file
    pub fn generate_sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Port cannot be 0".to_string()));
        }

        if self.database.url.is_empty() {
            return Err(ConfigError::Validation("Database URL cannot be empty".to_string()));
        }

        if self.health.heartbeat_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Heartbeat timeout must be at least 1 second".to_string(),
            ));
        }

        if self.orchestrator.max_parallel == 0 {
            return Err(ConfigError::Validation(
                "Orchestrator max_parallel must be at least 1".to_string(),
            ));
        }

        if self.deployment.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "Deployment poll interval cannot be 0".to_string(),
            ));
        }

        for path in [&self.precheck.membership_rest_path, &self.precheck.api_rest_path] {
            if !path.starts_with('/') {
                return Err(ConfigError::Validation(format!(
                    "Precheck REST path must start with '/': {}",
                    path
                )));
            }
        }

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read config file {0:?}: {1}")]
    FileRead(PathBuf, String),
    /// Failed to parse configuration
    #[error("Failed to parse config: {0}")]
    Parse(String),
    /// Configuration validation failed
    #[error("Config validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ShoalConfig::default();
        assert_eq!(config.server.port, 8801);
        assert_eq!(config.database.url, "sqlite:///var/lib/shoal/shoal.db");
        assert_eq!(config.health.heartbeat_timeout(), Duration::from_secs(30));
        assert_eq!(config.orchestrator.max_parallel, 8);
        assert!(config.agent.gateway_url.is_none());
    }

    #[test]
    fn test_config_validation() {
        let config = ShoalConfig::default();
        assert!(config.validate().is_ok());

        let mut invalid_config = ShoalConfig::default();
        invalid_config.server.port = 0;
        assert!(invalid_config.validate().is_err());

        let mut invalid_parallel = ShoalConfig::default();
        invalid_parallel.orchestrator.max_parallel = 0;
        assert!(invalid_parallel.validate().is_err());

        let mut invalid_path = ShoalConfig::default();
        invalid_path.precheck.api_rest_path = "overview".to_string();
        assert!(invalid_path.validate().is_err());
    }

    #[test]
    fn test_generate_sample_config() {
        let sample = ShoalConfig::generate_sample();
        assert!(sample.contains("[server]"));
        assert!(sample.contains("[database]"));
        assert!(sample.contains("[health]"));
        assert!(sample.contains("[orchestrator]"));
        assert!(sample.contains("[deployment]"));
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[health]\nheartbeat_timeout_secs = 45\n\n[agent]\ngateway_url = \"http://agents:9000\""
        )
        .unwrap();

        let config = ShoalConfig::load_from_file(&file.path().to_path_buf()).unwrap();
        assert_eq!(config.health.heartbeat_timeout_secs, 45);
        assert_eq!(config.agent.gateway_url.as_deref(), Some("http://agents:9000"));
        assert_eq!(config.server.port, 8801);
        assert_eq!(config.deployment.poll_interval_ms, 2000);
    }

    #[test]
    fn test_unparseable_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        let err = ShoalConfig::load_from_file(&file.path().to_path_buf()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
