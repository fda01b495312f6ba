//! Kernel configuration, read from YAML.
//!
//! ```yaml
//! transport:
//!   reply_timeout_ms: 10000
//! bootstrap:
//!   command: "./deploy-agent.sh {username}@{host} {command_port}"
//! groups:
//!   lab:
//!     policy: restart
//!     members:
//!       node1: { host: 10.0.0.11 }
//!       node2: { host: 10.0.0.12, username: root }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use therapyst_wire::{NodeAddress, TransportConfig};
use tokio::fs;
use tracing::warn;

use crate::bootstrap::{Bootstrap, NoopBootstrap, ShellBootstrap};
use crate::error::{KernelError, Result};
use crate::group::GroupConfig;
use crate::liveness::LivenessPolicy;
use crate::models::MemberSpec;

pub const CONFIG_ENV: &str = "THERAPYST_KERNEL_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "kernel.yaml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub transport: TransportConf,
    pub bootstrap: Option<BootstrapConf>,
    pub groups: BTreeMap<String, GroupConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConf {
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConf {
    pub command: String, // ex: "./deploy-agent.sh {username}@{host} {command_port}"
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupConf {
    pub heartbeat_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub member_timeout_ms: u64,
    pub supervisor_interval_ms: u64,
    pub policy: LivenessPolicy,
    pub members: BTreeMap<String, MemberConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberConf {
    pub host: String,
    #[serde(default = "default_command_port")]
    pub command_port: u16,
    #[serde(default = "default_result_port")]
    pub result_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

fn default_command_port() -> u16 {
    5556
}

fn default_result_port() -> u16 {
    5557
}

impl Default for TransportConf {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            connect_timeout_ms: defaults.connect_timeout.as_millis() as u64,
            reply_timeout_ms: defaults.reply_timeout.as_millis() as u64,
            max_frame_bytes: defaults.max_frame_bytes,
        }
    }
}

impl TransportConf {
    pub fn to_transport_config(&self) -> TransportConfig {
        TransportConfig {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            max_frame_bytes: self.max_frame_bytes,
        }
    }
}

impl Default for GroupConf {
    fn default() -> Self {
        let defaults = GroupConfig::default();
        Self {
            heartbeat_interval_ms: defaults.heartbeat_interval.as_millis() as u64,
            poll_interval_ms: defaults.poll_interval.as_millis() as u64,
            member_timeout_ms: defaults.member_timeout.as_millis() as u64,
            supervisor_interval_ms: defaults.supervisor_interval.as_millis() as u64,
            policy: defaults.policy,
            members: BTreeMap::new(),
        }
    }
}

impl GroupConf {
    pub fn to_group_config(&self) -> GroupConfig {
        GroupConfig {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            member_timeout: Duration::from_millis(self.member_timeout_ms),
            supervisor_interval: Duration::from_millis(self.supervisor_interval_ms),
            policy: self.policy,
            ..GroupConfig::default()
        }
    }

    pub fn member_specs(&self) -> Vec<MemberSpec> {
        self.members.iter().map(|(name, member)| member.to_spec(name)).collect()
    }
}

impl MemberConf {
    pub fn to_spec(&self, name: &str) -> MemberSpec {
        let spec = MemberSpec::new(name, NodeAddress::new(&self.host, self.command_port, self.result_port));
        match &self.username {
            Some(username) => spec.with_credentials(username, self.password.clone()),
            None => spec,
        }
    }
}

impl KernelConfig {
    pub fn group(&self, name: &str) -> Result<&GroupConf> {
        self.groups
            .get(name)
            .ok_or_else(|| KernelError::Config(format!("no group named {name}")))
    }

    pub fn bootstrap(&self) -> Arc<dyn Bootstrap> {
        match &self.bootstrap {
            Some(conf) => {
                let shell = ShellBootstrap::new(&conf.command);
                match conf.timeout_secs {
                    Some(secs) => Arc::new(shell.with_timeout(Duration::from_secs(secs))),
                    None => Arc::new(shell),
                }
            }
            None => Arc::new(NoopBootstrap),
        }
    }
}

/// `explicit`, else `$THERAPYST_KERNEL_CONFIG`, else `kernel.yaml`.
pub fn config_path(explicit: Option<&Path>) -> PathBuf {
    match explicit {
        Some(path) => path.to_path_buf(),
        None => std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE)),
    }
}

/// A missing or empty file yields the defaults; an invalid one is an error.
pub async fn load_config(path: &Path) -> Result<KernelConfig> {
    if !path.exists() {
        warn!(path = %path.display(), "No kernel config, using defaults");
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|e| KernelError::Config(format!("cannot read {}: {e}", path.display())))?;
    if txt.trim().is_empty() {
        return Ok(KernelConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|e| KernelError::Config(format!("{}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
transport:
  reply_timeout_ms: 2500
bootstrap:
  command: "./deploy.sh {host}"
groups:
  lab:
    policy: strict
    member_timeout_ms: 3000
    members:
      node1: { host: 10.0.0.11 }
      node2: { host: 10.0.0.12, command_port: 7000, result_port: 7001, username: root, password: toor }
"#;

    #[tokio::test]
    async fn test_load_sample() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = load_config(file.path()).await.unwrap();
        assert_eq!(config.transport.reply_timeout_ms, 2500);
        assert_eq!(config.transport.connect_timeout_ms, 5000);

        let lab = config.group("lab").unwrap();
        let group_config = lab.to_group_config();
        assert_eq!(group_config.policy, LivenessPolicy::Strict);
        assert_eq!(group_config.member_timeout, Duration::from_secs(3));
        assert_eq!(group_config.heartbeat_interval, GroupConfig::default().heartbeat_interval);

        let specs = lab.member_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "node1");
        assert_eq!(specs[0].address, NodeAddress::new("10.0.0.11", 5556, 5557));
        assert!(specs[0].credentials.is_none());
        assert_eq!(specs[1].address.command_port, 7000);
        assert_eq!(specs[1].username(), Some("root"));

        assert!(matches!(config.group("prod"), Err(KernelError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.yaml")).await.unwrap();
        assert!(config.groups.is_empty());

        let empty = dir.path().join("empty.yaml");
        std::fs::write(&empty, "   \n").unwrap();
        assert!(load_config(&empty).await.unwrap().bootstrap.is_none());

        let broken = dir.path().join("broken.yaml");
        std::fs::write(&broken, "groups: [oops").unwrap();
        assert!(matches!(load_config(&broken).await, Err(KernelError::Config(_))));
    }

    #[test]
    fn test_password_not_serialized() {
        let member: MemberConf = serde_yaml::from_str("{ host: h, username: u, password: p }").unwrap();
        let out = serde_yaml::to_string(&member).unwrap();
        assert!(!out.contains("password"));
    }

    #[test]
    fn test_explicit_path_wins() {
        assert_eq!(config_path(Some(Path::new("/tmp/k.yaml"))), PathBuf::from("/tmp/k.yaml"));
    }
}
