use serde::{Deserialize, Serialize};
use std::fmt;
use therapyst_wire::NodeAddress;

/// Login handed to the bootstrap capability. Never logged, never serialized.
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: Option<String>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// A node as the controller knows it.
#[derive(Debug, Clone)]
pub struct MemberSpec {
    pub name: String,
    pub address: NodeAddress,
    pub credentials: Option<Credentials>,
}

impl MemberSpec {
    pub fn new(name: impl Into<String>, address: NodeAddress) -> Self {
        Self {
            name: name.into(),
            address,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: Option<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password,
        });
        self
    }

    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.username.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

impl fmt::Display for HeartbeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeartbeatStatus::Unknown => "unknown",
            HeartbeatStatus::Healthy => "healthy",
            HeartbeatStatus::Unhealthy => "unhealthy",
        })
    }
}
