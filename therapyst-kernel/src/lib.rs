//! Therapyst kernel - the controller side
//!
//! - [`NodeProxy`]: one remote agent, commands out and results back
//! - [`Group`]: fan-out of commands to many members, fan-in of their results
//! - liveness supervision with restart through a [`Bootstrap`] capability

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod group;
pub mod health;
pub mod liveness;
pub mod models;
pub mod proxy;

pub use bootstrap::{Bootstrap, BootstrapError, NoopBootstrap, ShellBootstrap};
pub use config::{load_config, KernelConfig};
pub use error::{KernelError, Result};
pub use group::{Group, GroupConfig};
pub use health::{GroupHealth, MemberHealth};
pub use liveness::{LivenessPolicy, LivenessTracker, Verdict};
pub use models::{Credentials, HeartbeatStatus, MemberSpec};
pub use proxy::{NodeProxy, ProxyConfig};
