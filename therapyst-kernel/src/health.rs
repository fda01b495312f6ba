use serde::Serialize;
use time::OffsetDateTime;

use crate::models::HeartbeatStatus;

/// Snapshot of a group, as printed by `therapyst-kernel status`.
#[derive(Debug, Clone, Serialize)]
pub struct GroupHealth {
    pub group: String,
    pub started: bool,
    pub stopped: bool,
    pub failure: Option<String>,
    pub members: Vec<MemberHealth>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberHealth {
    pub name: String,
    pub address: String,
    pub status: HeartbeatStatus,
    pub last_healthy: Option<OffsetDateTime>,
    /// Commands given to the member whose result is not filed yet.
    pub outstanding_commands: usize,
    /// Results filed in the member map and not forgotten.
    pub filed_results: usize,
}

impl GroupHealth {
    pub fn healthy_members(&self) -> usize {
        self.members
            .iter()
            .filter(|m| m.status == HeartbeatStatus::Healthy)
            .count()
    }

    pub fn is_healthy(&self) -> bool {
        self.failure.is_none() && self.healthy_members() == self.members.len()
    }
}
