//! JSON encoding of messages, receipt texts, and length-prefixed framing.
//!
//! A frame is a 4-byte big-endian payload length followed by the payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, WireError};
use crate::message::{Command, CommandResult};

pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(command)?)
}

pub fn decode_command(payload: &[u8]) -> Result<Command> {
    Ok(serde_json::from_slice(payload)?)
}

pub fn encode_result(result: &CommandResult) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(result)?)
}

/// Decodes a result and checks that its id still matches its command.
pub fn decode_result(payload: &[u8]) -> Result<CommandResult> {
    let result: CommandResult = serde_json::from_slice(payload)?;
    if !result.is_paired() {
        return Err(WireError::Malformed(format!(
            "result id {} does not match command id {}",
            result.id(),
            result.command().id()
        )));
    }
    Ok(result)
}

/// Ack an agent gives when it accepted a shell command for execution.
pub fn command_receipt(id: &str) -> String {
    format!("received command {id}")
}

/// Ack an agent gives when it refused a command.
pub fn command_rejection(id: &str, reason: &str) -> String {
    format!("rejected command {id}: {reason}")
}

/// Ack the kernel gives for each delivered result.
pub fn result_receipt(id: &str) -> String {
    format!("received result {id}")
}

pub(crate) async fn write_frame<W>(io: &mut W, payload: &[u8], limit: usize) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            WireError::FrameTooLarge { size: payload.len(), limit },
        ));
    }
    io.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    io.write_all(payload).await?;
    io.flush().await
}

/// Reads one frame. `Ok(None)` means the peer closed cleanly between frames.
pub(crate) async fn read_frame<R>(io: &mut R, limit: usize) -> std::io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match io.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > limit {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            WireError::FrameTooLarge { size: len, limit },
        ));
    }

    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(Some(buf))
}
