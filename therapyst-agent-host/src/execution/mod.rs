//! Command execution module for therapyst agents
//!
//! Handles:
//! - Shell command execution with optional timeout
//! - The worker loop that drains the agent's work queue
//!
//! Command lines are split with shell quoting rules and run directly, without
//! an intermediate shell; pipelines need an explicit `sh -c '...'`.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use therapyst_wire::{Command, CommandKind, CommandResult};
use tokio::process::Command as AsyncCommand;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::stats::Counters;

/// Outcome of running one command line.
#[derive(Debug)]
pub struct Execution {
    pub output: String,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u128,
}

impl Execution {
    fn failed(reason: String, start_time: Instant) -> Self {
        Self {
            output: reason,
            exit_code: None,
            execution_time_ms: start_time.elapsed().as_millis(),
        }
    }
}

/// Runs shell commands for the agent's workers.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    /// Execute a command line, combining stdout and stderr.
    ///
    /// Never fails: spawn errors and timeouts become an execution without an
    /// exit code whose output explains what happened.
    pub async fn execute(&self, command_line: &str) -> Execution {
        let start_time = Instant::now();
        debug!(command_line, timeout = ?self.timeout, "Executing shell command");

        let argv = match shell_words::split(command_line) {
            Ok(argv) if !argv.is_empty() => argv,
            Ok(_) => return Execution::failed("empty command line".to_string(), start_time),
            Err(e) => return Execution::failed(format!("cannot parse command line: {e}"), start_time),
        };

        let mut child = AsyncCommand::new(&argv[0]);
        child
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, child.output()).await {
                Ok(output) => output,
                Err(_) => return Execution::failed(format!("command timed out after {}s", limit.as_secs_f32()), start_time),
            },
            None => child.output().await,
        };

        let output = match output {
            Ok(output) => output,
            Err(e) => return Execution::failed(format!("failed to execute {}: {e}", argv[0]), start_time),
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined_output = if stderr.is_empty() {
            stdout.to_string()
        } else {
            format!("{}\nSTDERR:\n{}", stdout, stderr)
        };

        Execution {
            output: combined_output,
            exit_code: output.status.code(),
            execution_time_ms: start_time.elapsed().as_millis(),
        }
    }

    /// Execute a shell command and build its result.
    pub async fn run(&self, command: &Command) -> CommandResult {
        let execution = self.execute(command.command_line()).await;
        info!(
            command_id = command.id(),
            exit_code = ?execution.exit_code,
            elapsed_ms = execution.execution_time_ms as u64,
            "Command finished"
        );
        CommandResult::completed(command, execution.output, execution.exit_code)
    }
}

/// Handles one queued command according to its kind.
pub(crate) async fn handle(executor: &CommandExecutor, command: &Command) -> CommandResult {
    match command.kind() {
        CommandKind::Shell => executor.run(command).await,
        CommandKind::Heartbeat => CommandResult::heartbeat_reply(command),
        CommandKind::Unknown(tag) => {
            warn!(command_id = command.id(), kind = %tag, "Unknown command kind");
            CommandResult::unknown_kind(command)
        }
    }
}

/// Worker loop: claim one command at a time until stopped.
///
/// A stop request is only seen between commands; a running execution is
/// always finished and its result queued.
pub(crate) async fn run_worker(
    index: usize,
    work_rx: Arc<Mutex<mpsc::Receiver<Command>>>,
    results_tx: mpsc::UnboundedSender<CommandResult>,
    executor: CommandExecutor,
    counters: Arc<Counters>,
    token: CancellationToken,
) {
    debug!(worker = index, "Worker started");
    loop {
        let command = {
            let mut rx = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                rx = work_rx.lock() => rx,
            };
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                command = rx.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            }
        };

        let result = handle(&executor, &command).await;
        counters.record(&command, if result.is_success() { "completed" } else { "failed" });
        if results_tx.send(result).is_err() {
            warn!(worker = index, "Result queue closed, worker exiting");
            break;
        }
    }
    debug!(worker = index, "Worker stopped");
}
