//! Therapyst Agent Host - runs on every managed node
//!
//! Accepts commands from the kernel on one endpoint, executes them on a
//! pool of workers and pushes results back on a second endpoint. Heartbeat
//! probes are answered immediately, even while every worker is busy.

pub mod config;
pub mod daemon;
mod delivery;
pub mod error;
pub mod execution;
pub mod stats;

pub use config::AgentConfig;
pub use daemon::{AgentDaemon, AgentState};
pub use error::AgentError;
pub use execution::CommandExecutor;
pub use stats::{AgentStats, CommandInfo};
