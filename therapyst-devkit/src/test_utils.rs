/*!
Test harness for therapyst

Runs real agent daemons on loopback ports and tears them down again, plus a
polling helper for conditions that become true asynchronously.
*/

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use therapyst_agent_host::{AgentConfig, AgentDaemon};
use therapyst_wire::NodeAddress;

const POLL: Duration = Duration::from_millis(20);

/// Poll `check` until it holds or `limit` elapses. Returns the last outcome.
pub async fn wait_until<F>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if check() {
            return true;
        }
        if start.elapsed() >= limit {
            log::warn!("Timeout after {:?} waiting for condition", limit);
            return false;
        }
        tokio::time::sleep(POLL).await;
    }
}

/// Named real agents on loopback.
pub struct TestHarness {
    agents: BTreeMap<String, AgentDaemon>,
}

impl TestHarness {
    pub fn new() -> Self {
        env_logger::try_init().ok(); // test logging, once per process
        Self {
            agents: BTreeMap::new(),
        }
    }

    /// Start an agent with `workers` workers and return where it listens.
    pub async fn spawn_agent(&mut self, name: &str, workers: usize) -> Result<NodeAddress> {
        let mut config = AgentConfig::loopback();
        config.execution.workers = workers;
        config.agent.hostname = name.to_string();
        self.spawn_agent_with(name, config).await
    }

    /// Start an agent on the ports of `address`, e.g. to restart one that died.
    pub async fn spawn_agent_at(&mut self, name: &str, workers: usize, address: &NodeAddress) -> Result<NodeAddress> {
        let mut config = AgentConfig::loopback();
        config.listen.bind_host = address.host.clone();
        config.listen.command_port = address.command_port;
        config.listen.result_port = address.result_port;
        config.execution.workers = workers;
        config.agent.hostname = name.to_string();
        self.spawn_agent_with(name, config).await
    }

    pub async fn spawn_agent_with(&mut self, name: &str, config: AgentConfig) -> Result<NodeAddress> {
        let mut daemon = AgentDaemon::new(config);
        daemon
            .start()
            .await
            .with_context(|| format!("Failed to start agent {}", name))?;
        let address = address_of(&daemon).with_context(|| format!("Agent {} has no bound address", name))?;
        log::info!("Agent {} listening on {}", name, address);
        self.agents.insert(name.to_string(), daemon);
        Ok(address)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentDaemon> {
        self.agents.get(name)
    }

    pub async fn stop_agent(&mut self, name: &str) -> Result<()> {
        let mut daemon = self
            .agents
            .remove(name)
            .ok_or_else(|| anyhow::anyhow!("No agent named {}", name))?;
        daemon.stop().await;
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        for (_, mut daemon) in std::mem::take(&mut self.agents) {
            daemon.stop().await;
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn address_of(daemon: &AgentDaemon) -> Option<NodeAddress> {
    let command = daemon.command_addr()?;
    let result = daemon.result_addr()?;
    Some(NodeAddress::new(command.ip().to_string(), command.port(), result.port()))
}
