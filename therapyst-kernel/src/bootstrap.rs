//! Bringing an agent up on a node.
//!
//! The group calls [`Bootstrap::ensure_agent_running`] for the initial
//! install and whenever the liveness supervisor decides a member needs a
//! restart. How the agent gets there (ssh, an orchestrator, a local script)
//! is up to the implementation.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

use crate::models::MemberSpec;

/// Environment variable carrying the member password to the bootstrap command.
pub const PASSWORD_ENV: &str = "THERAPYST_PASSWORD";

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("invalid bootstrap command: {0}")]
    Template(String),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("bootstrap exited with {status:?}: {output}")]
    Failed { status: Option<i32>, output: String },
}

#[async_trait]
pub trait Bootstrap: Send + Sync {
    async fn ensure_agent_running(&self, member: &MemberSpec) -> Result<(), BootstrapError>;
}

/// Runs a command template per member.
///
/// Placeholders: `{name}` `{host}` `{command_port}` `{result_port}`
/// `{username}`. The template is split into words first, so a substituted
/// value always stays a single argument.
#[derive(Debug, Clone)]
pub struct ShellBootstrap {
    template: String,
    timeout: Option<Duration>,
}

impl ShellBootstrap {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn render(&self, member: &MemberSpec) -> Result<Vec<String>, BootstrapError> {
        let words = shell_words::split(&self.template).map_err(|e| BootstrapError::Template(e.to_string()))?;
        if words.is_empty() {
            return Err(BootstrapError::Template("empty command".to_string()));
        }
        let command_port = member.address.command_port.to_string();
        let result_port = member.address.result_port.to_string();
        Ok(words
            .into_iter()
            .map(|word| {
                word.replace("{name}", &member.name)
                    .replace("{host}", &member.address.host)
                    .replace("{command_port}", &command_port)
                    .replace("{result_port}", &result_port)
                    .replace("{username}", member.username().unwrap_or(""))
            })
            .collect())
    }
}

#[async_trait]
impl Bootstrap for ShellBootstrap {
    async fn ensure_agent_running(&self, member: &MemberSpec) -> Result<(), BootstrapError> {
        let argv = self.render(member)?;
        debug!(member = %member.name, program = %argv[0], "Running bootstrap command");

        let mut child = Command::new(&argv[0]);
        child
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = member.credentials.as_ref().and_then(|c| c.password.as_deref()) {
            child.env(PASSWORD_ENV, password);
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.output())
                .await
                .map_err(|_| BootstrapError::Failed {
                    status: None,
                    output: format!("timed out after {}s", limit.as_secs_f32()),
                })?,
            None => child.output().await,
        }
        .map_err(|source| BootstrapError::Spawn {
            program: argv[0].clone(),
            source,
        })?;

        if output.status.success() {
            info!(member = %member.name, "Bootstrap command succeeded");
            Ok(())
        } else {
            let mut text = String::from_utf8_lossy(&output.stdout).to_string();
            text.push_str(&String::from_utf8_lossy(&output.stderr));
            Err(BootstrapError::Failed {
                status: output.status.code(),
                output: text.trim().to_string(),
            })
        }
    }
}

/// For agents managed by something else.
#[derive(Debug, Clone, Default)]
pub struct NoopBootstrap;

#[async_trait]
impl Bootstrap for NoopBootstrap {
    async fn ensure_agent_running(&self, member: &MemberSpec) -> Result<(), BootstrapError> {
        info!(member = %member.name, "No bootstrap configured, assuming the agent is managed elsewhere");
        Ok(())
    }
}
