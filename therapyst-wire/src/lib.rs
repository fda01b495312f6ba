//! Therapyst wire protocol
//!
//! Shared by the kernel and every agent:
//! - [`Command`] / [`CommandResult`] value types and their JSON encoding
//! - length-prefixed framing
//! - [`Channel`], a strictly alternating request/response connection
//! - [`TransportContext`], the factory each actor opens its own channels from

pub mod channel;
pub mod codec;
pub mod error;
pub mod message;
pub mod transport;

pub use channel::{Channel, Role, Step};
pub use codec::{
    command_receipt, command_rejection, decode_command, decode_result, encode_command, encode_result,
    result_receipt,
};
pub use error::WireError;
pub use message::{Command, CommandKind, CommandResult, HEARTBEAT_REPLY, UNKNOWN_ADVICE};
pub use transport::{Endpoint, NodeAddress, TransportConfig, TransportContext};
