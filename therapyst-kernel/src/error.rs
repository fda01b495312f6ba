use std::time::Duration;
use thiserror::Error;
use therapyst_wire::WireError;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("communication with {member} failed: {source}")]
    Communication {
        member: String,
        #[source]
        source: WireError,
    },

    #[error("{member} did not accept the command: {ack}")]
    Rejected { member: String, ack: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("member {member} of group {group} unhealthy for {unhealthy_for:?}")]
    LivenessTimeout {
        group: String,
        member: String,
        unhealthy_for: Duration,
    },

    #[error("group {group} has failed: {reason}")]
    GroupFailed { group: String, reason: String },

    #[error("member {0} is already in the group")]
    DuplicateMember(String),

    #[error("no member named {0}")]
    UnknownMember(String),

    #[error("stopped")]
    Stopped,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, KernelError>;
