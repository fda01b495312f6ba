/*!
Raw wire payloads for tests

Builds JSON exactly as it travels on the wire, including payloads no
well-behaved peer would ever send, so decoders can be tested against them.
*/

use anyhow::Result;
use serde_json::{json, Value};

pub struct WireFixtures;

impl WireFixtures {
    pub fn command_json(id: &str, command_line: &str, kind: &str) -> Value {
        json!({
            "id": id,
            "commandLine": command_line,
            "errorExpected": false,
            "kind": kind,
        })
    }

    pub fn result_json(id: &str, output: &str, exit_code: Option<i32>, command: Value) -> Value {
        json!({
            "id": id,
            "output": output,
            "exitCode": exit_code,
            "command": command,
        })
    }

    pub fn heartbeat_reply_json(id: &str) -> Value {
        Self::result_json(id, "heartbeat_reply", Some(0), Self::command_json(id, "", "heartbeat"))
    }

    /// A result whose id does not match the command it carries.
    pub fn unpaired_result_json() -> Value {
        Self::result_json("abc", "ok", Some(0), Self::command_json("xyz", "ls", "shell"))
    }

    /// Payloads that must never decode as a command.
    pub fn malformed_payloads() -> Vec<Vec<u8>> {
        vec![
            b"".to_vec(),
            b"{not json".to_vec(),
            b"[1, 2, 3]".to_vec(),
            br#"{"commandLine": "ls", "kind": "shell"}"#.to_vec(),
            vec![0xff, 0xfe, 0x00],
        ]
    }

    pub fn to_bytes(value: &Value) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }
}
