//! Agent configuration
//!
//! Handles:
//! - listening endpoints (command and result ports)
//! - worker pool sizing
//! - channel timeouts
//!
//! Stored as TOML in the OS config directory unless a path is given.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use therapyst_wire::TransportConfig;

pub const DEFAULT_COMMAND_PORT: u16 = 5556;
pub const DEFAULT_RESULT_PORT: u16 = 5557;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub listen: ListenConfig,
    pub execution: ExecutionConfig,
    pub transport: TransportSettings,
    pub agent: AgentInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub bind_host: String,
    pub command_port: u16,
    pub result_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Number of worker tasks executing shell commands.
    pub workers: usize,
    /// Accepted but not yet started commands; beyond this new commands are rejected.
    pub queue_capacity: usize,
    /// Kill commands running longer than this. Unbounded when absent.
    pub command_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentInfo {
    pub hostname: String,
    pub version: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            command_port: DEFAULT_COMMAND_PORT,
            result_port: DEFAULT_RESULT_PORT,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_capacity: 1024,
            command_timeout_secs: None,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            reply_timeout_ms: defaults.reply_timeout.as_millis() as u64,
            max_frame_bytes: defaults.max_frame_bytes,
        }
    }
}

impl Default for AgentInfo {
    fn default() -> Self {
        Self {
            hostname: hostname::get().unwrap_or_default().to_string_lossy().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl TransportSettings {
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

impl ExecutionConfig {
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout_secs.map(Duration::from_secs)
    }
}

impl AgentConfig {
    /// Loopback agent on OS-assigned ports, for tests and local runs.
    pub fn loopback() -> Self {
        let mut config = Self::default();
        config.listen = ListenConfig {
            bind_host: "127.0.0.1".to_string(),
            command_port: 0,
            result_port: 0,
        };
        config
    }

    /// Load config from `path`, or from the OS-specific location.
    /// A missing file yields the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_file_path()?,
        };

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid agent config {}", config_path.display()))
    }

    /// Save config to `path`, creating parent directories.
    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("therapyst-agent");
        path.push("config.toml");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.listen.command_port, 5556);
        assert_eq!(config.listen.result_port, 5557);
        assert_eq!(config.execution.workers, 10);
        assert_eq!(config.execution.command_timeout(), None);
    }

    #[test]
    fn test_config_file_path() {
        let path = AgentConfig::config_file_path().unwrap();
        assert!(path.to_string_lossy().contains("therapyst-agent"));
        assert!(path.to_string_lossy().contains("config.toml"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: AgentConfig = toml::from_str(
            r#"
            [listen]
            command_port = 6000

            [execution]
            workers = 2
            command_timeout_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.listen.command_port, 6000);
        assert_eq!(config.listen.result_port, DEFAULT_RESULT_PORT);
        assert_eq!(config.execution.workers, 2);
        assert_eq!(config.execution.queue_capacity, 1024);
        assert_eq!(config.execution.command_timeout(), Some(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = AgentConfig::loopback();
        config.execution.workers = 3;
        config.save(&path).await.unwrap();

        let loaded = AgentConfig::load(Some(&path)).await.unwrap();
        assert_eq!(loaded.listen.bind_host, "127.0.0.1");
        assert_eq!(loaded.execution.workers, 3);

        let missing = AgentConfig::load(Some(&dir.path().join("absent.toml"))).await.unwrap();
        assert_eq!(missing.listen.command_port, DEFAULT_COMMAND_PORT);
    }
}
