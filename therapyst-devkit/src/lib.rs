/*!
# Therapyst DevKit - test tooling

- a scripted mock agent speaking the real wire protocol on loopback
- builders for raw wire payloads, valid and broken
- a harness running real agents and a polling helper
*/

pub mod fixtures;
pub mod mock_agent;
pub mod test_utils;

pub use fixtures::WireFixtures;
pub use mock_agent::{HeartbeatMode, MockAgent, RecordedCommand};
pub use test_utils::{wait_until, TestHarness};
