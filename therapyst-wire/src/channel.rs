//! Strict-alternation request/response channel over one TCP connection.
//!
//! A requester must send, then receive, then send again; a responder must
//! receive first. Out-of-turn calls are refused before touching the socket.
//! Any transport failure breaks the channel for good: the peer may be midway
//! through a frame, so the only safe recovery is a new connection.

use std::fmt;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::codec::{read_frame, write_frame};
use crate::error::{Result, WireError};
use crate::transport::TransportConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Requester,
    Responder,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Requester => f.write_str("requester"),
            Role::Responder => f.write_str("responder"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Send,
    Recv,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::Send => f.write_str("send"),
            Step::Recv => f.write_str("receive"),
        }
    }
}

/// One end of a synchronous, strictly alternating transport.
///
/// A `Channel` is owned by exactly one task; every method takes `&mut self`.
#[derive(Debug)]
pub struct Channel {
    stream: TcpStream,
    peer: String,
    role: Role,
    next: Step,
    broken: bool,
    reply_timeout: Duration,
    max_frame_bytes: usize,
}

impl Channel {
    pub(crate) fn new(stream: TcpStream, peer: String, role: Role, config: &TransportConfig) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
        }
        Self {
            stream,
            peer,
            role,
            next: match role {
                Role::Requester => Step::Send,
                Role::Responder => Step::Recv,
            },
            broken: false,
            reply_timeout: config.reply_timeout,
            max_frame_bytes: config.max_frame_bytes,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Sends one frame. Bounded by the reply timeout.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        self.check(Step::Send)?;
        if payload.len() > self.max_frame_bytes {
            return Err(WireError::FrameTooLarge {
                size: payload.len(),
                limit: self.max_frame_bytes,
            });
        }

        let limit = self.max_frame_bytes;
        let written = timeout(self.reply_timeout, write_frame(&mut self.stream, payload, limit)).await;
        match written {
            Ok(Ok(())) => {
                self.next = Step::Recv;
                Ok(())
            }
            Ok(Err(e)) => Err(self.fail_io(e)),
            Err(_) => Err(self.fail_timeout()),
        }
    }

    /// Receives one frame.
    ///
    /// A requester waiting for its reply gives up after the reply timeout; a
    /// responder waiting for the next request waits as long as it takes.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        self.check(Step::Recv)?;

        let limit = self.max_frame_bytes;
        let role = self.role;
        let outcome = match role {
            Role::Requester => {
                let waited = timeout(self.reply_timeout, read_frame(&mut self.stream, limit)).await;
                match waited {
                    Ok(read) => read,
                    Err(_) => return Err(self.fail_timeout()),
                }
            }
            Role::Responder => read_frame(&mut self.stream, limit).await,
        };

        match outcome {
            Ok(Some(frame)) => {
                self.next = Step::Send;
                Ok(frame)
            }
            Ok(None) => {
                let peer = self.peer.clone();
                Err(self.fail(WireError::Closed { peer }))
            }
            Err(e) => Err(self.fail_io(e)),
        }
    }

    /// Send followed by receive, for requesters.
    pub async fn request(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send(payload).await?;
        self.recv().await
    }

    /// Convenience for the short text acks used by both channel roles.
    pub async fn request_text(&mut self, payload: &[u8]) -> Result<String> {
        let reply = self.request(payload).await?;
        String::from_utf8(reply).map_err(|e| WireError::Malformed(e.to_string()))
    }

    fn check(&self, attempted: Step) -> Result<()> {
        if self.broken {
            return Err(WireError::Broken {
                peer: self.peer.clone(),
            });
        }
        if attempted != self.next {
            return Err(WireError::OutOfTurn {
                role: self.role,
                attempted,
                expected: self.next,
            });
        }
        Ok(())
    }

    fn fail(&mut self, error: WireError) -> WireError {
        self.broken = true;
        error
    }

    fn fail_timeout(&mut self) -> WireError {
        let error = WireError::Timeout {
            peer: self.peer.clone(),
            timeout: self.reply_timeout,
        };
        self.fail(error)
    }

    fn fail_io(&mut self, error: std::io::Error) -> WireError {
        let error = if error.get_ref().is_some_and(|inner| inner.is::<WireError>()) {
            match error.into_inner().map(|inner| inner.downcast::<WireError>()) {
                Some(Ok(wire)) => *wire,
                _ => WireError::Malformed("unreadable frame".to_string()),
            }
        } else {
            WireError::Io {
                peer: self.peer.clone(),
                source: error,
            }
        };
        self.fail(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{NodeAddress, TransportContext};

    async fn connected_pair(config: TransportConfig) -> (Channel, Channel) {
        let transport = TransportContext::new(config);
        let endpoint = transport.bind_command_endpoint("127.0.0.1:0").await.unwrap();
        let port = endpoint.local_addr().unwrap().port();
        let node = NodeAddress::new("127.0.0.1", port, 0);
        let (requester, responder) = tokio::join!(transport.open_command_channel(&node), endpoint.accept());
        (requester.unwrap(), responder.unwrap())
    }

    #[tokio::test]
    async fn test_request_and_reply() {
        let (mut requester, mut responder) = connected_pair(TransportConfig::default()).await;
        assert_eq!(requester.role(), Role::Requester);
        assert_eq!(responder.role(), Role::Responder);

        let server = tokio::spawn(async move {
            let request = responder.recv().await.unwrap();
            assert_eq!(request, b"ping");
            responder.send(b"pong").await.unwrap();
            responder
        });

        assert_eq!(requester.request_text(b"ping").await.unwrap(), "pong");
        let mut responder = server.await.unwrap();

        // second round on the same connection
        let server = tokio::spawn(async move {
            let request = responder.recv().await.unwrap();
            responder.send(&request).await.unwrap();
        });
        assert_eq!(requester.request(b"again").await.unwrap(), b"again");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_out_of_turn_calls_are_refused() {
        let (mut requester, mut responder) = connected_pair(TransportConfig::default()).await;

        assert!(matches!(
            requester.recv().await,
            Err(WireError::OutOfTurn { attempted: Step::Recv, expected: Step::Send, .. })
        ));
        assert!(matches!(
            responder.send(b"early").await,
            Err(WireError::OutOfTurn { role: Role::Responder, .. })
        ));

        requester.send(b"one").await.unwrap();
        assert!(matches!(requester.send(b"two").await, Err(WireError::OutOfTurn { .. })));
        // refusals do not break the channel
        assert!(!requester.is_broken());
        assert_eq!(responder.recv().await.unwrap(), b"one");
    }

    #[tokio::test]
    async fn test_silent_responder_times_out_and_breaks_channel() {
        let config = TransportConfig {
            reply_timeout: Duration::from_millis(100),
            ..TransportConfig::default()
        };
        let (mut requester, _responder) = connected_pair(config).await;

        assert!(matches!(requester.request(b"hello").await, Err(WireError::Timeout { .. })));
        assert!(requester.is_broken());
        assert!(matches!(requester.send(b"hello").await, Err(WireError::Broken { .. })));
    }

    #[tokio::test]
    async fn test_peer_close_is_reported() {
        let (mut requester, responder) = connected_pair(TransportConfig::default()).await;
        drop(responder);
        let err = requester.request(b"anyone?").await.unwrap_err();
        assert!(matches!(err, WireError::Closed { .. } | WireError::Io { .. }));
        assert!(requester.is_broken());
    }

    #[tokio::test]
    async fn test_oversized_send_is_refused_without_breaking() {
        let config = TransportConfig {
            max_frame_bytes: 8,
            ..TransportConfig::default()
        };
        let (mut requester, _responder) = connected_pair(config).await;
        assert!(matches!(
            requester.send(b"way too long").await,
            Err(WireError::FrameTooLarge { size: 12, limit: 8 })
        ));
        assert!(!requester.is_broken());
    }
}
