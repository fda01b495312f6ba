use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use therapyst_wire::Command;

use crate::daemon::AgentState;

/// Last command the agent touched, reported in [`AgentStats`].
#[derive(Debug, Clone, Serialize)]
pub struct CommandInfo {
    pub command_id: String,
    pub command_type: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

/// Point-in-time view of a running agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStats {
    pub state: AgentState,
    pub hostname: String,
    pub version: String,
    pub started_at: Option<DateTime<Utc>>,
    pub command_addr: Option<String>,
    pub result_addr: Option<String>,
    pub commands_received: u64,
    pub heartbeats_answered: u64,
    pub results_sent: u64,
    pub last_command: Option<CommandInfo>,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub commands_received: AtomicU64,
    pub heartbeats_answered: AtomicU64,
    pub results_sent: AtomicU64,
    last_command: Mutex<Option<CommandInfo>>,
}

impl Counters {
    pub fn record(&self, command: &Command, status: &str) {
        let info = CommandInfo {
            command_id: command.id().to_string(),
            command_type: command.kind().to_string(),
            status: status.to_string(),
            timestamp: Utc::now(),
        };
        *self.last_command.lock() = Some(info);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn load(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }

    pub fn last_command(&self) -> Option<CommandInfo> {
        self.last_command.lock().clone()
    }
}
