use std::time::Duration;
use thiserror::Error;

use crate::channel::{Role, Step};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error with {peer}: {source}")]
    Io {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{peer} did not respond within {timeout:?}")]
    Timeout { peer: String, timeout: Duration },

    #[error("{peer} closed the channel")]
    Closed { peer: String },

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("{role} channel cannot {attempted} now, its next step is {expected}")]
    OutOfTurn {
        role: Role,
        attempted: Step,
        expected: Step,
    },

    #[error("channel to {peer} is broken by an earlier failure")]
    Broken { peer: String },

    #[error("malformed message: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for WireError {
    fn from(e: serde_json::Error) -> Self {
        WireError::Malformed(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
