//! Shared channel factory for both sides of the protocol.
//!
//! Each node exposes two endpoints. On the command endpoint the kernel is the
//! requester (it sends commands, the agent acks). On the result endpoint the
//! agent is the requester (it sends results, the kernel acks). The kernel
//! connects to both, the agent binds both.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::channel::{Channel, Role};
use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::error::{Result, WireError};

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub connect_timeout: Duration,
    /// Upper bound on a single send, and on a requester waiting for its reply.
    pub reply_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Where a node's agent listens.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub command_port: u16,
    pub result_port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, command_port: u16, result_port: u16) -> Self {
        Self {
            host: host.into(),
            command_port,
            result_port,
        }
    }

    pub fn command_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.command_port)
    }

    pub fn result_endpoint(&self) -> String {
        format!("{}:{}", self.host, self.result_port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.command_port, self.result_port)
    }
}

/// Thread-safe factory every actor opens its own channels from.
#[derive(Debug, Clone, Default)]
pub struct TransportContext {
    config: Arc<TransportConfig>,
}

impl TransportContext {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Kernel side: channel for submitting commands to a node.
    pub async fn open_command_channel(&self, node: &NodeAddress) -> Result<Channel> {
        self.connect(node.command_endpoint(), Role::Requester).await
    }

    /// Kernel side: channel on which a node pushes its results.
    pub async fn open_result_channel(&self, node: &NodeAddress) -> Result<Channel> {
        self.connect(node.result_endpoint(), Role::Responder).await
    }

    /// Agent side: accepted connections answer commands.
    pub async fn bind_command_endpoint(&self, addr: &str) -> Result<Endpoint> {
        self.bind(addr, Role::Responder).await
    }

    /// Agent side: accepted connections carry results to the kernel.
    pub async fn bind_result_endpoint(&self, addr: &str) -> Result<Endpoint> {
        self.bind(addr, Role::Requester).await
    }

    async fn connect(&self, addr: String, role: Role) -> Result<Channel> {
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(WireError::Connect { addr, source }),
            Err(_) => {
                return Err(WireError::Timeout {
                    peer: addr,
                    timeout: self.config.connect_timeout,
                })
            }
        };
        debug!(peer = %addr, %role, "channel opened");
        Ok(Channel::new(stream, addr, role, &self.config))
    }

    async fn bind(&self, addr: &str, role: Role) -> Result<Endpoint> {
        let listener = TcpListener::bind(addr).await.map_err(|source| WireError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        Ok(Endpoint {
            listener,
            role,
            config: self.config.clone(),
        })
    }
}

/// A bound listening socket producing channels of one role.
#[derive(Debug)]
pub struct Endpoint {
    listener: TcpListener,
    role: Role,
    config: Arc<TransportConfig>,
}

impl Endpoint {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|source| WireError::Io {
            peer: "local endpoint".to_string(),
            source,
        })
    }

    pub async fn accept(&self) -> Result<Channel> {
        let (stream, peer) = self.listener.accept().await.map_err(|source| WireError::Io {
            peer: "listener".to_string(),
            source,
        })?;
        debug!(peer = %peer, role = %self.role, "channel accepted");
        Ok(Channel::new(stream, peer.to_string(), self.role, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_address_endpoints() {
        let node = NodeAddress::new("192.168.2.8", 5556, 5557);
        assert_eq!(node.command_endpoint(), "192.168.2.8:5556");
        assert_eq!(node.result_endpoint(), "192.168.2.8:5557");
        assert_eq!(node.to_string(), "192.168.2.8:5556/5557");
    }

    #[tokio::test]
    async fn test_result_endpoint_roles_are_reversed() {
        let transport = TransportContext::default();
        let endpoint = transport.bind_result_endpoint("127.0.0.1:0").await.unwrap();
        let node = NodeAddress::new("127.0.0.1", 0, endpoint.local_addr().unwrap().port());

        let (kernel_side, agent_side) = tokio::join!(transport.open_result_channel(&node), endpoint.accept());
        let mut kernel_side = kernel_side.unwrap();
        let mut agent_side = agent_side.unwrap();
        assert_eq!(kernel_side.role(), Role::Responder);
        assert_eq!(agent_side.role(), Role::Requester);

        let kernel = tokio::spawn(async move {
            let result = kernel_side.recv().await.unwrap();
            kernel_side.send(&result).await.unwrap();
        });
        assert_eq!(agent_side.request(b"result").await.unwrap(), b"result");
        kernel.await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let transport = TransportContext::default();
        let endpoint = transport.bind_command_endpoint("127.0.0.1:0").await.unwrap();
        let port = endpoint.local_addr().unwrap().port();
        drop(endpoint);

        let node = NodeAddress::new("127.0.0.1", port, 0);
        assert!(matches!(
            transport.open_command_channel(&node).await,
            Err(WireError::Connect { .. })
        ));
    }
}
