/*!
Scripted mock agent

Speaks the real wire protocol on loopback ports but executes nothing. It
records every command in arrival order, answers heartbeats the way it is told
to, and lets a test push arbitrary results (duplicates included) down the
result channel.
*/

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use therapyst_wire::{
    command_receipt, command_rejection, decode_command, encode_result, result_receipt, Channel, Command, CommandKind,
    CommandResult, Endpoint, NodeAddress, TransportContext,
};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// How the mock answers heartbeat probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    /// Proper `heartbeat_reply` with the probe's id.
    Healthy,
    /// A decodable result that is not a heartbeat reply.
    WrongReply,
    /// Hang up without answering.
    Silent,
}

#[derive(Debug, Clone)]
pub struct RecordedCommand {
    pub command: Command,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug)]
struct Script {
    heartbeat: HeartbeatMode,
    auto_complete: bool,
    accepting: bool,
}

#[derive(Debug, Default)]
struct Recorded {
    commands: Vec<RecordedCommand>,
    heartbeats: usize,
    result_acks: Vec<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct MockAgent {
    address: NodeAddress,
    script: Arc<Mutex<Script>>,
    recorded: Arc<Mutex<Recorded>>,
    results_tx: mpsc::UnboundedSender<CommandResult>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MockAgent {
    /// Bind both endpoints on loopback ephemeral ports and start serving.
    pub async fn start() -> Result<Self> {
        let transport = TransportContext::default();
        let commands = transport.bind_command_endpoint("127.0.0.1:0").await?;
        let results = transport.bind_result_endpoint("127.0.0.1:0").await?;
        let address = NodeAddress::new(
            "127.0.0.1",
            commands.local_addr()?.port(),
            results.local_addr()?.port(),
        );

        let script = Arc::new(Mutex::new(Script {
            heartbeat: HeartbeatMode::Healthy,
            auto_complete: true,
            accepting: true,
        }));
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(serve_commands(
                commands,
                script.clone(),
                recorded.clone(),
                results_tx.clone(),
                token.clone(),
            )),
            tokio::spawn(push_results(results, results_rx, recorded.clone(), token.clone())),
        ];
        log::info!("[MOCK] agent listening on {}", address);

        Ok(Self {
            address,
            script,
            recorded,
            results_tx,
            token,
            tasks,
        })
    }

    pub fn address(&self) -> NodeAddress {
        self.address.clone()
    }

    pub fn set_heartbeat_mode(&self, mode: HeartbeatMode) {
        lock(&self.script).heartbeat = mode;
    }

    /// When on (the default) every accepted command gets a result echoing its
    /// command line with exit code 0.
    pub fn set_auto_complete(&self, on: bool) {
        lock(&self.script).auto_complete = on;
    }

    /// When off, commands are answered with a rejection instead of a receipt.
    pub fn set_accepting(&self, on: bool) {
        lock(&self.script).accepting = on;
    }

    /// Queue a result for delivery to the kernel.
    pub fn push_result(&self, result: CommandResult) -> Result<()> {
        self.results_tx
            .send(result)
            .map_err(|e| anyhow::anyhow!("mock agent stopped: {}", e))
    }

    /// Non-heartbeat commands, in arrival order.
    pub fn commands(&self) -> Vec<Command> {
        lock(&self.recorded)
            .commands
            .iter()
            .map(|recorded| recorded.command.clone())
            .collect()
    }

    pub fn recorded(&self) -> Vec<RecordedCommand> {
        lock(&self.recorded).commands.clone()
    }

    pub fn heartbeats(&self) -> usize {
        lock(&self.recorded).heartbeats
    }

    /// Acks the kernel sent back for delivered results.
    pub fn result_acks(&self) -> Vec<String> {
        lock(&self.recorded).result_acks.clone()
    }

    pub async fn stop(mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        log::info!("[MOCK] agent on {} stopped", self.address);
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn serve_commands(
    endpoint: Endpoint,
    script: Arc<Mutex<Script>>,
    recorded: Arc<Mutex<Recorded>>,
    results_tx: mpsc::UnboundedSender<CommandResult>,
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
                        script.clone(),
                        recorded.clone(),
                        results_tx.clone(),
                        token.clone(),
                    ));
                }
                Err(e) => log::warn!("[MOCK] accept failed: {}", e),
            },
        }
    }
    connections.shutdown().await;
}

async fn serve_connection(
    mut channel: Channel,
    script: Arc<Mutex<Script>>,
    recorded: Arc<Mutex<Recorded>>,
    results_tx: mpsc::UnboundedSender<CommandResult>,
    token: CancellationToken,
) {
    loop {
        let payload = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            payload = channel.recv() => match payload {
                Ok(payload) => payload,
                Err(_) => return,
            },
        };
        let command = match decode_command(&payload) {
            Ok(command) => command,
            Err(e) => {
                log::error!("[MOCK] malformed command: {}", e);
                return;
            }
        };

        let reply = if *command.kind() == CommandKind::Heartbeat {
            lock(&recorded).heartbeats += 1;
            let mode = lock(&script).heartbeat;
            let answer = match mode {
                HeartbeatMode::Healthy => CommandResult::heartbeat_reply(&command),
                HeartbeatMode::WrongReply => CommandResult::completed(&command, "not a heartbeat", Some(0)),
                HeartbeatMode::Silent => return,
            };
            match encode_result(&answer) {
                Ok(reply) => reply,
                Err(_) => return,
            }
        } else {
            lock(&recorded).commands.push(RecordedCommand {
                command: command.clone(),
                received_at: Utc::now(),
            });
            let (accepting, auto_complete) = {
                let script = lock(&script);
                (script.accepting, script.auto_complete)
            };
            if !accepting {
                command_rejection(command.id(), "mock agent not accepting").into_bytes()
            } else {
                if auto_complete {
                    let output = format!("mock: {}", command.command_line());
                    let _ = results_tx.send(CommandResult::completed(&command, output, Some(0)));
                }
                command_receipt(command.id()).into_bytes()
            }
        };

        if channel.send(&reply).await.is_err() {
            return;
        }
    }
}

async fn push_results(
    endpoint: Endpoint,
    mut results_rx: mpsc::UnboundedReceiver<CommandResult>,
    recorded: Arc<Mutex<Recorded>>,
    token: CancellationToken,
) {
    let mut channel: Option<Channel> = None;
    while let Some(result) = tokio::select! {
        biased;
        _ = token.cancelled() => None,
        result = results_rx.recv() => result,
    } {
        let Ok(payload) = encode_result(&result) else { continue };
        loop {
            if channel.is_none() {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return,
                    accepted = endpoint.accept() => match accepted {
                        Ok(accepted) => channel = Some(accepted),
                        Err(_) => {
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    },
                }
            }
            let Some(conn) = channel.as_mut() else { continue };
            match conn.request_text(&payload).await {
                Ok(ack) => {
                    if ack != result_receipt(result.id()) {
                        log::warn!("[MOCK] unexpected ack {}", ack);
                    }
                    lock(&recorded).result_acks.push(ack);
                    break;
                }
                Err(_) => channel = None,
            }
        }
    }
}
