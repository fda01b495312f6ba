use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use therapyst_kernel::{Bootstrap, BootstrapError, GroupConfig, LivenessPolicy, MemberSpec};

/// Bootstrap that only remembers who it was asked to start.
#[derive(Default)]
pub struct RecordingBootstrap {
    calls: Mutex<Vec<String>>,
}

impl RecordingBootstrap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Bootstrap for RecordingBootstrap {
    async fn ensure_agent_running(&self, member: &MemberSpec) -> Result<(), BootstrapError> {
        self.calls.lock().unwrap().push(member.name.clone());
        Ok(())
    }
}

pub fn fast_config(policy: LivenessPolicy) -> GroupConfig {
    GroupConfig {
        heartbeat_interval: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        member_timeout: Duration::from_millis(300),
        supervisor_interval: Duration::from_millis(25),
        reconnect_interval: Duration::from_millis(50),
        policy,
    }
}
