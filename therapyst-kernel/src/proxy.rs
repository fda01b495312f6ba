//! Node proxy: the controller's handle on one remote agent.
//!
//! Background tasks once started:
//! - heartbeat prober, one persistent command channel re-opened on failure
//! - result listener, holding the result channel and filing every result by id
//!
//! Callers submit commands on channels of their own, so a slow submission
//! never delays a probe.
//!
//! A result that never comes (the agent died mid-command) is only given up on
//! through [`NodeProxy::abandon_in_flight`]; the group calls it when it
//! restarts the member.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use therapyst_wire::{
    command_receipt, decode_result, encode_command, result_receipt, Channel, Command, CommandResult, NodeAddress,
    TransportContext, WireError,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{KernelError, Result};
use crate::models::HeartbeatStatus;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub reconnect_interval: Duration,
    /// How long a claimed or abandoned id is remembered to catch late copies.
    pub settled_grace: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            reconnect_interval: Duration::from_millis(500),
            settled_grace: Duration::from_secs(300),
        }
    }
}

#[derive(Default)]
struct Filed {
    pending: HashMap<String, CommandResult>,
    settled: HashMap<String, Instant>,
}

impl Filed {
    fn prune(&mut self, grace: Duration) {
        let now = Instant::now();
        self.settled.retain(|_, at| now.duration_since(*at) < grace);
    }

    fn settle(&mut self, id: &str) {
        self.settled.insert(id.to_string(), Instant::now());
    }
}

enum Waited {
    Filed(CommandResult),
    Empty,
    Stopped,
    Abandoned,
}

struct Inner {
    name: String,
    address: NodeAddress,
    config: ProxyConfig,
    transport: TransportContext,
    status: Mutex<HeartbeatStatus>,
    filed: Mutex<Filed>,
    arrived: Notify,
    generation: AtomicU64,
    started: AtomicBool,
    token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn set_status(&self, next: HeartbeatStatus) {
        let previous = std::mem::replace(&mut *self.status.lock(), next);
        if previous != next {
            info!(member = %self.name, from = %previous, to = %next, "Heartbeat status changed");
        }
    }

    /// File a result unless one with the same id was filed or abandoned before.
    fn file(&self, result: CommandResult) -> bool {
        {
            let mut filed = self.filed.lock();
            filed.prune(self.config.settled_grace);
            if filed.pending.contains_key(result.id()) || filed.settled.contains_key(result.id()) {
                warn!(member = %self.name, command_id = result.id(), "Duplicate or late result dropped");
                return false;
            }
            filed.pending.insert(result.id().to_string(), result);
        }
        self.arrived.notify_waiters();
        true
    }

    fn take(&self, id: &str) -> Option<CommandResult> {
        let mut filed = self.filed.lock();
        let result = filed.pending.remove(id)?;
        filed.settle(id);
        Some(result)
    }

    fn give_up(&self, id: &str) {
        let mut filed = self.filed.lock();
        filed.pending.remove(id);
        filed.settle(id);
    }

    fn communication(&self, source: WireError) -> KernelError {
        KernelError::Communication {
            member: self.name.clone(),
            source,
        }
    }
}

#[derive(Clone)]
pub struct NodeProxy {
    inner: Arc<Inner>,
}

impl NodeProxy {
    pub fn new(name: impl Into<String>, address: NodeAddress, config: ProxyConfig, transport: TransportContext) -> Self {
        Self::with_token(name, address, config, transport, CancellationToken::new())
    }

    pub(crate) fn with_token(
        name: impl Into<String>,
        address: NodeAddress,
        config: ProxyConfig,
        transport: TransportContext,
        token: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                address,
                config,
                transport,
                status: Mutex::new(HeartbeatStatus::Unknown),
                filed: Mutex::new(Filed::default()),
                arrived: Notify::new(),
                generation: AtomicU64::new(0),
                started: AtomicBool::new(false),
                token,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> &NodeAddress {
        &self.inner.address
    }

    /// Launch the prober and the result listener. Later calls do nothing.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(member = %self.inner.name, address = %self.inner.address, "Starting node proxy");
        let prober = tokio::spawn(run_prober(self.inner.clone()));
        let listener = tokio::spawn(run_result_listener(self.inner.clone()));
        self.inner.tasks.lock().extend([prober, listener]);
    }

    /// Send one command and wait for the agent's ack, not for its execution.
    pub async fn submit_command(&self, command: &Command) -> Result<bool> {
        let (accepted, _) = self.deliver(command).await?;
        Ok(accepted)
    }

    async fn deliver(&self, command: &Command) -> Result<(bool, String)> {
        let payload = encode_command(command).map_err(|e| KernelError::Protocol(e.to_string()))?;
        let mut channel = self
            .inner
            .transport
            .open_command_channel(&self.inner.address)
            .await
            .map_err(|e| self.inner.communication(e))?;
        let ack = channel
            .request_text(&payload)
            .await
            .map_err(|e| self.inner.communication(e))?;
        debug!(member = %self.inner.name, command_id = command.id(), ack = %ack, "Command acked");
        Ok((ack == command_receipt(command.id()), ack))
    }

    /// Remove and return the result for `command`.
    ///
    /// With `block` the call waits until the result is filed or the proxy is
    /// stopped (`None`); without it the call returns at once.
    pub async fn await_result(&self, command: &Command, block: bool, poll_interval: Duration) -> Option<CommandResult> {
        match self.wait_for(command.id(), block, poll_interval, None).await {
            Waited::Filed(result) => Some(result),
            Waited::Empty | Waited::Stopped | Waited::Abandoned => None,
        }
    }

    /// Only waits started before generation `since` moved on are abandoned.
    async fn wait_for(&self, id: &str, block: bool, poll_interval: Duration, since: Option<u64>) -> Waited {
        loop {
            let arrived = self.inner.arrived.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(result) = self.inner.take(id) {
                return Waited::Filed(result);
            }
            if self.inner.token.is_cancelled() {
                return Waited::Stopped;
            }
            if since.is_some_and(|generation| generation != self.inner.generation.load(Ordering::SeqCst)) {
                return Waited::Abandoned;
            }
            if !block {
                return Waited::Empty;
            }

            tokio::select! {
                _ = &mut arrived => {}
                _ = sleep(poll_interval) => {}
                _ = self.inner.token.cancelled() => {}
            }
        }
    }

    /// Submit, then block until the result comes back.
    ///
    /// Fails with [`KernelError::Communication`] when the wait is abandoned,
    /// with [`KernelError::Stopped`] when the proxy stops first.
    pub async fn submit_and_await(&self, command: &Command) -> Result<CommandResult> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let (accepted, ack) = self.deliver(command).await?;
        if !accepted {
            return Err(KernelError::Rejected {
                member: self.inner.name.clone(),
                ack,
            });
        }
        match self
            .wait_for(command.id(), true, self.inner.config.poll_interval, Some(generation))
            .await
        {
            Waited::Filed(result) => Ok(result),
            Waited::Abandoned => {
                self.inner.give_up(command.id());
                Err(self.inner.communication(WireError::Closed {
                    peer: self.inner.address.to_string(),
                }))
            }
            Waited::Empty | Waited::Stopped => Err(KernelError::Stopped),
        }
    }

    /// Fail every `submit_and_await` currently waiting for a result.
    ///
    /// Results of those commands arriving later are dropped. Commands
    /// submitted afterwards are not affected.
    pub fn abandon_in_flight(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.arrived.notify_waiters();
        info!(member = %self.inner.name, generation, "Abandoning results still in flight");
    }

    /// One probe on a fresh channel; updates and returns the status.
    pub async fn probe_heartbeat(&self) -> HeartbeatStatus {
        let mut channel = None;
        let status = probe(&self.inner, &mut channel).await;
        self.inner.set_status(status);
        status
    }

    pub fn heartbeat_status(&self) -> HeartbeatStatus {
        *self.inner.status.lock()
    }

    pub fn mark_unhealthy(&self) {
        self.inner.set_status(HeartbeatStatus::Unhealthy);
    }

    /// Results filed but not yet claimed.
    pub fn pending_results(&self) -> usize {
        self.inner.filed.lock().pending.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Cancel the background tasks and wait for them.
    pub async fn stop(&self) {
        self.inner.token.cancel();
        self.inner.arrived.notify_waiters();
        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(member = %self.inner.name, error = %e, "Proxy task failed");
            }
        }
        debug!(member = %self.inner.name, "Node proxy stopped");
    }
}

async fn probe(inner: &Inner, channel: &mut Option<Channel>) -> HeartbeatStatus {
    if channel.is_none() {
        match inner.transport.open_command_channel(&inner.address).await {
            Ok(opened) => *channel = Some(opened),
            Err(e) => {
                debug!(member = %inner.name, error = %e, "Heartbeat connect failed");
                return HeartbeatStatus::Unhealthy;
            }
        }
    }
    let Some(conn) = channel.as_mut() else {
        return HeartbeatStatus::Unhealthy;
    };

    let heartbeat = Command::heartbeat();
    let payload = match encode_command(&heartbeat) {
        Ok(payload) => payload,
        Err(e) => {
            error!(member = %inner.name, error = %e, "Failed to encode heartbeat");
            return HeartbeatStatus::Unhealthy;
        }
    };

    match conn.request(&payload).await {
        Ok(reply) => match decode_result(&reply) {
            Ok(result) if result.is_heartbeat_reply_for(&heartbeat) => HeartbeatStatus::Healthy,
            Ok(result) => {
                warn!(member = %inner.name, output = result.output(), "Unexpected heartbeat reply");
                HeartbeatStatus::Unhealthy
            }
            Err(e) => {
                warn!(member = %inner.name, error = %e, "Undecodable heartbeat reply");
                *channel = None;
                HeartbeatStatus::Unhealthy
            }
        },
        Err(e) => {
            debug!(member = %inner.name, error = %e, "Heartbeat failed");
            *channel = None;
            HeartbeatStatus::Unhealthy
        }
    }
}

async fn run_prober(inner: Arc<Inner>) {
    let mut ticker = interval(inner.config.heartbeat_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut channel = None;
    loop {
        tokio::select! {
            biased;
            _ = inner.token.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let status = probe(&inner, &mut channel).await;
        inner.set_status(status);
    }
    debug!(member = %inner.name, "Heartbeat prober stopped");
}

async fn run_result_listener(inner: Arc<Inner>) {
    let mut channel: Option<Channel> = None;
    loop {
        if channel.is_none() {
            let opened = tokio::select! {
                biased;
                _ = inner.token.cancelled() => break,
                opened = inner.transport.open_result_channel(&inner.address) => opened,
            };
            match opened {
                Ok(opened) => {
                    debug!(member = %inner.name, "Result channel connected");
                    channel = Some(opened);
                }
                Err(e) => {
                    debug!(member = %inner.name, error = %e, "Result channel connect failed");
                    inner.set_status(HeartbeatStatus::Unhealthy);
                    tokio::select! {
                        biased;
                        _ = inner.token.cancelled() => break,
                        _ = sleep(inner.config.reconnect_interval) => continue,
                    }
                }
            }
        }
        let Some(conn) = channel.as_mut() else { continue };

        let received = tokio::select! {
            biased;
            _ = inner.token.cancelled() => break,
            received = conn.recv() => received,
        };
        let payload = match received {
            Ok(payload) => payload,
            Err(e) => {
                debug!(member = %inner.name, error = %e, "Result channel lost");
                channel = None;
                continue;
            }
        };

        let result = match decode_result(&payload) {
            Ok(result) => result,
            Err(e) => {
                error!(member = %inner.name, error = %e, "Malformed result, dropping connection");
                channel = None;
                continue;
            }
        };
        let receipt = result_receipt(result.id());
        inner.file(result);
        if let Err(e) = conn.send(receipt.as_bytes()).await {
            warn!(member = %inner.name, error = %e, "Failed to ack result");
            channel = None;
        }
    }
    debug!(member = %inner.name, "Result listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use therapyst_devkit::{wait_until, MockAgent};
    use therapyst_wire::CommandKind;

    fn unreachable_proxy() -> NodeProxy {
        // nothing listens on port 1 of loopback
        NodeProxy::new(
            "ghost",
            NodeAddress::new("127.0.0.1", 1, 1),
            ProxyConfig::default(),
            TransportContext::default(),
        )
    }

    #[tokio::test]
    async fn test_first_result_wins() {
        let proxy = unreachable_proxy();
        let command = Command::with_id("abc", "ls", CommandKind::Shell);
        assert!(proxy.inner.file(CommandResult::completed(&command, "first", Some(0))));
        assert!(!proxy.inner.file(CommandResult::completed(&command, "second", Some(0))));

        let result = proxy.await_result(&command, false, Duration::from_millis(10)).await.unwrap();
        assert_eq!(result.output(), "first");
        assert!(proxy.await_result(&command, false, Duration::from_millis(10)).await.is_none());

        // a late copy after the result was claimed is still a duplicate
        assert!(!proxy.inner.file(CommandResult::completed(&command, "late", Some(0))));
    }

    #[tokio::test]
    async fn test_blocking_await_wakes_on_arrival() {
        let proxy = unreachable_proxy();
        let command = Command::shell("true");
        let waiter = {
            let proxy = proxy.clone();
            let command = command.clone();
            tokio::spawn(async move { proxy.await_result(&command, true, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        proxy.inner.file(CommandResult::completed(&command, "done", Some(0)));

        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(result.unwrap().output(), "done");
    }

    #[tokio::test]
    async fn test_blocking_await_ends_on_stop() {
        let proxy = unreachable_proxy();
        let command = Command::shell("true");
        let waiter = {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.await_result(&command, true, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        proxy.stop().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_settled_ids_expire_after_grace() {
        let config = ProxyConfig {
            settled_grace: Duration::from_millis(50),
            ..ProxyConfig::default()
        };
        let proxy = NodeProxy::new("node1", NodeAddress::new("127.0.0.1", 1, 1), config, TransportContext::default());
        let first = Command::shell("echo 1");
        proxy.inner.file(CommandResult::completed(&first, "1", Some(0)));
        assert!(proxy.await_result(&first, false, Duration::from_millis(10)).await.is_some());
        assert_eq!(proxy.inner.filed.lock().settled.len(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let second = Command::shell("echo 2");
        assert!(proxy.inner.file(CommandResult::completed(&second, "2", Some(0))));
        let filed = proxy.inner.filed.lock();
        assert!(filed.settled.is_empty());
        assert_eq!(filed.pending.len(), 1);
    }

    #[tokio::test]
    async fn test_abandon_fails_the_waiting_submission() {
        let agent = MockAgent::start().await.unwrap();
        agent.set_auto_complete(false);
        let proxy = NodeProxy::new("node1", agent.address(), ProxyConfig::default(), TransportContext::default());
        proxy.start();

        let command = Command::shell("sleep 600");
        let waiter = {
            let proxy = proxy.clone();
            let command = command.clone();
            tokio::spawn(async move { proxy.submit_and_await(&command).await })
        };
        assert!(wait_until(Duration::from_secs(5), || agent.commands().len() == 1).await);
        proxy.abandon_in_flight();

        let outcome = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(outcome, Err(KernelError::Communication { ref member, .. }) if member == "node1"));

        // the lost result turning up after all is not filed
        agent.push_result(CommandResult::completed(&command, "late", Some(0))).unwrap();
        assert!(wait_until(Duration::from_secs(5), || agent.result_acks().len() == 1).await);
        assert_eq!(proxy.pending_results(), 0);

        agent.set_auto_complete(true);
        let result = proxy.submit_and_await(&Command::shell("echo after")).await.unwrap();
        assert_eq!(result.output(), "mock: echo after");

        proxy.stop().await;
        agent.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let proxy = unreachable_proxy();
        assert_eq!(proxy.heartbeat_status(), HeartbeatStatus::Unknown);
        assert_eq!(proxy.probe_heartbeat().await, HeartbeatStatus::Unhealthy);

        let err = proxy.submit_command(&Command::shell("ls")).await.unwrap_err();
        assert!(matches!(err, KernelError::Communication { ref member, .. } if member == "ghost"));
    }
}
