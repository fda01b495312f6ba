//! Agent daemon: the node side of the protocol.
//!
//! Tasks started by [`AgentDaemon::start`]:
//! - a listener accepting command connections, with one responder task per
//!   connection; heartbeats are answered inline there, never queued
//! - `workers` workers draining a bounded work queue
//! - one sender pushing results to the kernel
//!
//! Lifecycle: `NotStarted -> Running -> Stopping -> Stopped`.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use therapyst_wire::{
    command_receipt, command_rejection, decode_command, encode_result, Channel, Command, CommandKind, CommandResult,
    Endpoint, TransportContext, WireError,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::delivery::run_sender;
use crate::error::AgentError;
use crate::execution::{run_worker, CommandExecutor};
use crate::stats::{AgentStats, Counters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    NotStarted,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AgentState::NotStarted => "not started",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

struct Tasks {
    listener: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
    sender: JoinHandle<()>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Command>>>,
    results_tx: mpsc::UnboundedSender<CommandResult>,
}

/// Main agent state
pub struct AgentDaemon {
    config: AgentConfig,
    transport: TransportContext,
    state: Arc<Mutex<AgentState>>,
    counters: Arc<Counters>,
    token: CancellationToken,
    started_at: Option<DateTime<Utc>>,
    command_addr: Option<SocketAddr>,
    result_addr: Option<SocketAddr>,
    tasks: Option<Tasks>,
}

impl AgentDaemon {
    pub fn new(config: AgentConfig) -> Self {
        let transport = TransportContext::new(config.transport.to_transport_config());
        Self {
            config,
            transport,
            state: Arc::new(Mutex::new(AgentState::NotStarted)),
            counters: Arc::new(Counters::default()),
            token: CancellationToken::new(),
            started_at: None,
            command_addr: None,
            result_addr: None,
            tasks: None,
        }
    }

    pub fn state(&self) -> AgentState {
        *self.state.lock()
    }

    fn set_state(&self, next: AgentState) {
        *self.state.lock() = next;
    }

    /// Address the command endpoint is actually bound to.
    pub fn command_addr(&self) -> Option<SocketAddr> {
        self.command_addr
    }

    /// Address the result endpoint is actually bound to.
    pub fn result_addr(&self) -> Option<SocketAddr> {
        self.result_addr
    }

    /// Bind both endpoints and launch listener, workers and sender.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        let state = self.state();
        if state != AgentState::NotStarted {
            return Err(AgentError::InvalidState {
                operation: "start",
                state,
            });
        }

        let listen = &self.config.listen;
        let command_endpoint = self
            .transport
            .bind_command_endpoint(&format!("{}:{}", listen.bind_host, listen.command_port))
            .await?;
        let result_endpoint = self
            .transport
            .bind_result_endpoint(&format!("{}:{}", listen.bind_host, listen.result_port))
            .await?;
        self.command_addr = Some(command_endpoint.local_addr()?);
        self.result_addr = Some(result_endpoint.local_addr()?);

        let execution = &self.config.execution;
        let (work_tx, work_rx) = mpsc::channel(execution.queue_capacity.max(1));
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        let executor = CommandExecutor::new(execution.command_timeout());

        let workers = (0..execution.workers.max(1))
            .map(|index| {
                tokio::spawn(run_worker(
                    index,
                    work_rx.clone(),
                    results_tx.clone(),
                    executor.clone(),
                    self.counters.clone(),
                    self.token.clone(),
                ))
            })
            .collect();
        let listener = tokio::spawn(run_listener(
            command_endpoint,
            work_tx,
            self.counters.clone(),
            self.token.clone(),
        ));
        let sender = tokio::spawn(run_sender(
            result_endpoint,
            results_rx,
            self.counters.clone(),
            self.token.clone(),
        ));

        self.tasks = Some(Tasks {
            listener,
            workers,
            sender,
            work_rx,
            results_tx,
        });
        self.started_at = Some(Utc::now());
        self.set_state(AgentState::Running);

        info!(
            hostname = %self.config.agent.hostname,
            command_addr = ?self.command_addr,
            result_addr = ?self.result_addr,
            workers = execution.workers.max(1),
            "Agent started"
        );
        Ok(())
    }

    /// Stop accepting commands, let in-flight executions finish, deliver
    /// what can still be delivered, and join every task.
    ///
    /// Commands that were accepted but never started get an undelivered
    /// result so the kernel is not left waiting for them. No-op unless running.
    pub async fn stop(&mut self) {
        let Some(tasks) = self.tasks.take() else {
            return;
        };
        self.set_state(AgentState::Stopping);
        info!("Agent stopping");
        self.token.cancel();

        if let Err(e) = tasks.listener.await {
            error!(error = %e, "Listener task failed");
        }
        for joined in join_all(tasks.workers).await {
            if let Err(e) = joined {
                error!(error = %e, "Worker task failed");
            }
        }

        let mut abandoned = 0usize;
        {
            let mut work_rx = tasks.work_rx.lock().await;
            while let Ok(command) = work_rx.try_recv() {
                let result = CommandResult::undelivered(&command, "agent stopped before executing the command");
                if tasks.results_tx.send(result).is_ok() {
                    abandoned += 1;
                }
            }
        }
        if abandoned > 0 {
            warn!(abandoned, "Queued commands abandoned at shutdown");
        }

        drop(tasks.results_tx);
        if let Err(e) = tasks.sender.await {
            error!(error = %e, "Sender task failed");
        }

        self.set_state(AgentState::Stopped);
        info!("Agent stopped");
    }

    pub fn stats(&self) -> AgentStats {
        AgentStats {
            state: self.state(),
            hostname: self.config.agent.hostname.clone(),
            version: self.config.agent.version.clone(),
            started_at: self.started_at,
            command_addr: self.command_addr.map(|addr| addr.to_string()),
            result_addr: self.result_addr.map(|addr| addr.to_string()),
            commands_received: Counters::load(&self.counters.commands_received),
            heartbeats_answered: Counters::load(&self.counters.heartbeats_answered),
            results_sent: Counters::load(&self.counters.results_sent),
            last_command: self.counters.last_command(),
        }
    }
}

impl Drop for AgentDaemon {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Accept command connections until stopped.
async fn run_listener(
    endpoint: Endpoint,
    work_tx: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            accepted = endpoint.accept() => match accepted {
                Ok(channel) => {
                    connections.spawn(serve_connection(
                        channel,
                        work_tx.clone(),
                        counters.clone(),
                        token.clone(),
                    ));
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept command connection");
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            },
        }
    }
    drop(endpoint);
    while connections.join_next().await.is_some() {}
    debug!("Listener stopped");
}

/// Responder loop for one kernel-side requester.
async fn serve_connection(
    mut channel: Channel,
    work_tx: mpsc::Sender<Command>,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            request = channel.recv() => request,
        };
        let payload = match request {
            Ok(payload) => payload,
            Err(WireError::Closed { .. }) => break,
            Err(e) => {
                debug!(peer = channel.peer(), error = %e, "Command connection failed");
                break;
            }
        };

        let command = match decode_command(&payload) {
            Ok(command) => command,
            Err(e) => {
                error!(peer = channel.peer(), error = %e, "Malformed command, dropping connection");
                break;
            }
        };

        let reply = match answer(command, &work_tx, &counters) {
            Ok(reply) => reply,
            Err(e) => {
                error!(peer = channel.peer(), error = %e, "Failed to encode reply, dropping connection");
                break;
            }
        };
        if let Err(e) = channel.send(&reply).await {
            warn!(peer = channel.peer(), error = %e, "Failed to send reply");
            break;
        }
    }
}

/// Heartbeats are answered with their full result right here; everything
/// else goes to the work queue and is acked with a receipt.
fn answer(command: Command, work_tx: &mpsc::Sender<Command>, counters: &Counters) -> Result<Vec<u8>, WireError> {
    Counters::bump(&counters.commands_received);
    match command.kind() {
        CommandKind::Heartbeat => {
            Counters::bump(&counters.heartbeats_answered);
            debug!(command_id = command.id(), "Heartbeat answered");
            encode_result(&CommandResult::heartbeat_reply(&command))
        }
        CommandKind::Shell | CommandKind::Unknown(_) => {
            let id = command.id().to_string();
            counters.record(&command, "queued");
            match work_tx.try_send(command) {
                Ok(()) => {
                    debug!(command_id = %id, "Command queued");
                    Ok(command_receipt(&id).into_bytes())
                }
                Err(TrySendError::Full(command)) => {
                    warn!(command_id = %id, "Work queue full, rejecting command");
                    counters.record(&command, "rejected");
                    Ok(command_rejection(&id, "work queue full").into_bytes())
                }
                Err(TrySendError::Closed(command)) => {
                    counters.record(&command, "rejected");
                    Ok(command_rejection(&id, "agent stopping").into_bytes())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use therapyst_wire::{decode_result, encode_command, result_receipt, NodeAddress, HEARTBEAT_REPLY};

    fn node_of(daemon: &AgentDaemon) -> NodeAddress {
        NodeAddress::new(
            "127.0.0.1",
            daemon.command_addr().unwrap().port(),
            daemon.result_addr().unwrap().port(),
        )
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let mut daemon = AgentDaemon::new(AgentConfig::loopback());
        assert_eq!(daemon.state(), AgentState::NotStarted);

        daemon.start().await.unwrap();
        assert_eq!(daemon.state(), AgentState::Running);
        assert!(matches!(daemon.start().await, Err(AgentError::InvalidState { .. })));

        daemon.stop().await;
        assert_eq!(daemon.state(), AgentState::Stopped);
        daemon.stop().await;
        assert_eq!(daemon.state(), AgentState::Stopped);
    }

    #[tokio::test]
    async fn test_heartbeat_answered_inline() {
        let mut daemon = AgentDaemon::new(AgentConfig::loopback());
        daemon.start().await.unwrap();
        let transport = TransportContext::default();

        let mut channel = transport.open_command_channel(&node_of(&daemon)).await.unwrap();
        let probe = Command::heartbeat();
        let reply = channel.request(&encode_command(&probe).unwrap()).await.unwrap();
        let reply = decode_result(&reply).unwrap();
        assert_eq!(reply.id(), probe.id());
        assert_eq!(reply.output(), HEARTBEAT_REPLY);
        assert_eq!(daemon.stats().heartbeats_answered, 1);

        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_shell_command_receipt_then_result() {
        let mut daemon = AgentDaemon::new(AgentConfig::loopback());
        daemon.start().await.unwrap();
        let transport = TransportContext::default();
        let node = node_of(&daemon);

        let command = Command::shell("echo therapy");
        let mut commands = transport.open_command_channel(&node).await.unwrap();
        let ack = commands.request_text(&encode_command(&command).unwrap()).await.unwrap();
        assert_eq!(ack, command_receipt(command.id()));

        let mut results = transport.open_result_channel(&node).await.unwrap();
        let result = decode_result(&results.recv().await.unwrap()).unwrap();
        results.send(result_receipt(result.id()).as_bytes()).await.unwrap();
        assert_eq!(result.id(), command.id());
        assert_eq!(result.exit_code(), Some(0));
        assert_eq!(result.output().trim(), "therapy");

        daemon.stop().await;
        let stats = daemon.stats();
        assert_eq!(stats.commands_received, 1);
        assert_eq!(stats.results_sent, 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects() {
        let mut config = AgentConfig::loopback();
        config.execution.workers = 1;
        config.execution.queue_capacity = 1;
        let mut daemon = AgentDaemon::new(config);
        daemon.start().await.unwrap();
        let transport = TransportContext::default();
        let mut channel = transport.open_command_channel(&node_of(&daemon)).await.unwrap();

        // one running, one queued, the next is refused
        let mut acks = Vec::new();
        for _ in 0..3 {
            let command = Command::shell("sleep 1");
            let ack = channel.request_text(&encode_command(&command).unwrap()).await.unwrap();
            acks.push((command, ack));
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert_eq!(acks[0].1, command_receipt(acks[0].0.id()));
        assert_eq!(acks[1].1, command_receipt(acks[1].0.id()));
        assert_eq!(acks[2].1, command_rejection(acks[2].0.id(), "work queue full"));

        daemon.stop().await;
    }

    #[tokio::test]
    async fn test_malformed_command_drops_connection() {
        let mut daemon = AgentDaemon::new(AgentConfig::loopback());
        daemon.start().await.unwrap();
        let transport = TransportContext::default();

        let mut channel = transport.open_command_channel(&node_of(&daemon)).await.unwrap();
        assert!(channel.request(b"{not a command").await.is_err());

        // the agent itself keeps serving
        let mut channel = transport.open_command_channel(&node_of(&daemon)).await.unwrap();
        let reply = channel.request(&encode_command(&Command::heartbeat()).unwrap()).await;
        assert!(reply.is_ok());

        daemon.stop().await;
    }
}
