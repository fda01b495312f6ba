//! Command and result value types exchanged between the kernel and its agents.
//!
//! A [`Command`] asks a node to run a shell command line or to answer a
//! heartbeat probe. A [`CommandResult`] (the "rant") is the outcome of exactly
//! one command and carries the command's id back for correlation. Results can
//! only be built from a `&Command`, so `result.id() == command.id()` holds by
//! construction.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use uuid::Uuid;

/// Output of the reply an agent gives to a heartbeat probe.
pub const HEARTBEAT_REPLY: &str = "heartbeat_reply";

/// Output of the result an agent gives to a command kind it does not know.
pub const UNKNOWN_ADVICE: &str = "unknown advice";

/// Exit code carried by the unknown-kind result.
pub const UNKNOWN_ADVICE_EXIT_CODE: i32 = 1;

/// What a node is asked to do with a command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Shell,
    Heartbeat,
    /// Any tag this build does not understand; the original tag is kept.
    Unknown(String),
}

impl CommandKind {
    pub fn as_str(&self) -> &str {
        match self {
            CommandKind::Shell => "shell",
            CommandKind::Heartbeat => "heartbeat",
            CommandKind::Unknown(tag) => tag,
        }
    }

    pub fn parse(tag: &str) -> Self {
        match tag {
            "shell" => CommandKind::Shell,
            "heartbeat" => CommandKind::Heartbeat,
            other => CommandKind::Unknown(other.to_string()),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for CommandKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CommandKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(CommandKind::parse(&tag))
    }
}

/// A request for a managed node. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    command_line: String,
    #[serde(default)]
    error_expected: bool,
    kind: CommandKind,
}

impl Command {
    /// Shell command with a freshly generated id.
    pub fn shell(command_line: impl Into<String>) -> Self {
        Self::with_id(new_command_id(), command_line, CommandKind::Shell)
    }

    /// Heartbeat probe with a freshly generated id.
    pub fn heartbeat() -> Self {
        Self::with_id(new_command_id(), "", CommandKind::Heartbeat)
    }

    /// Command with a caller supplied id.
    pub fn with_id(id: impl Into<String>, command_line: impl Into<String>, kind: CommandKind) -> Self {
        Self {
            id: id.into(),
            command_line: command_line.into(),
            error_expected: false,
            kind,
        }
    }

    /// Marks a nonzero exit as expected, so consumers do not flag it.
    pub fn expecting_error(mut self) -> Self {
        self.error_expected = true;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn error_expected(&self) -> bool {
        self.error_expected
    }

    pub fn kind(&self) -> &CommandKind {
        &self.kind
    }
}

/// Outcome of one command.
///
/// `exit_code` is `None` when no exit status exists: the process could not be
/// spawned, was killed by a signal or timed out, or the command never reached
/// its node. A legitimate zero exit is always `Some(0)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    id: String,
    output: String,
    exit_code: Option<i32>,
    command: Command,
}

impl CommandResult {
    pub fn completed(command: &Command, output: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self {
            id: command.id.clone(),
            output: output.into(),
            exit_code,
            command: command.clone(),
        }
    }

    pub fn heartbeat_reply(command: &Command) -> Self {
        Self::completed(command, HEARTBEAT_REPLY, Some(0))
    }

    pub fn unknown_kind(command: &Command) -> Self {
        Self::completed(command, UNKNOWN_ADVICE, Some(UNKNOWN_ADVICE_EXIT_CODE))
    }

    /// Result for a command that never produced an outcome on its node.
    pub fn undelivered(command: &Command, reason: impl Into<String>) -> Self {
        Self::completed(command, reason, None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Failed, and the command did not say it expected to.
    pub fn is_noteworthy_failure(&self) -> bool {
        !self.is_success() && !self.command.error_expected
    }

    pub fn is_heartbeat_reply_for(&self, probe: &Command) -> bool {
        self.id == probe.id && self.output == HEARTBEAT_REPLY
    }

    /// True when the id still matches the embedded command's id.
    pub(crate) fn is_paired(&self) -> bool {
        self.id == self.command.id
    }
}

/// Generates a new command id. Called per command, never cached.
pub fn new_command_id() -> String {
    Uuid::new_v4().to_string()
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}
