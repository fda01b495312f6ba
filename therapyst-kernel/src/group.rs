//! Group coordinator: fan a command out to every member, fan results back in.
//!
//! Each member owns a private FIFO queue drained by its dispatcher, so one
//! slow node never holds up the others while its own commands still run in
//! the order they were given. A supervisor watches heartbeats and restarts
//! (or, under the strict policy, fails the group on) members that stay
//! unhealthy for longer than `member_timeout`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use therapyst_wire::{Command, CommandResult, TransportContext};
use time::OffsetDateTime;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bootstrap::{Bootstrap, BootstrapError};
use crate::config::GroupConf;
use crate::error::{KernelError, Result};
use crate::health::{GroupHealth, MemberHealth};
use crate::liveness::{LivenessPolicy, LivenessTracker, Verdict};
use crate::models::{HeartbeatStatus, MemberSpec};
use crate::proxy::{NodeProxy, ProxyConfig};

#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub heartbeat_interval: Duration,
    pub poll_interval: Duration,
    pub member_timeout: Duration,
    pub supervisor_interval: Duration,
    pub reconnect_interval: Duration,
    pub policy: LivenessPolicy,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            poll_interval: Duration::from_millis(50),
            member_timeout: Duration::from_secs(10),
            supervisor_interval: Duration::from_millis(500),
            reconnect_interval: Duration::from_millis(500),
            policy: LivenessPolicy::Restart,
        }
    }
}

impl GroupConfig {
    fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            heartbeat_interval: self.heartbeat_interval,
            poll_interval: self.poll_interval,
            reconnect_interval: self.reconnect_interval,
            ..ProxyConfig::default()
        }
    }
}

/// Why a strict group gave up.
#[derive(Debug, Clone)]
struct LivenessFailure {
    member: String,
    unhealthy_for: Duration,
}

struct Member {
    spec: MemberSpec,
    proxy: NodeProxy,
    queue_tx: mpsc::UnboundedSender<Command>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    outstanding: AtomicUsize,
    results: Mutex<HashMap<String, CommandResult>>,
    last_healthy_at: Mutex<Option<OffsetDateTime>>,
    token: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Member {
    fn new(spec: MemberSpec, config: &GroupConfig, transport: &TransportContext, parent: &CancellationToken) -> Self {
        let token = parent.child_token();
        let proxy = NodeProxy::with_token(
            spec.name.clone(),
            spec.address.clone(),
            config.proxy_config(),
            transport.clone(),
            token.child_token(),
        );
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Self {
            spec,
            proxy,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            outstanding: AtomicUsize::new(0),
            results: Mutex::new(HashMap::new()),
            last_healthy_at: Mutex::new(None),
            token,
            dispatcher: Mutex::new(None),
        }
    }

    fn name(&self) -> &str {
        &self.spec.name
    }

    /// Start the proxy and the dispatcher, once.
    fn launch(self: &Arc<Self>, filed: Arc<Notify>) {
        let Some(queue_rx) = self.queue_rx.lock().take() else {
            return;
        };
        self.proxy.start();
        let handle = tokio::spawn(run_dispatcher(self.clone(), queue_rx, filed));
        *self.dispatcher.lock() = Some(handle);
    }

    fn file(&self, result: CommandResult) {
        let mut results = self.results.lock();
        if results.contains_key(result.id()) {
            warn!(member = %self.name(), command_id = result.id(), "Duplicate result dropped");
            return;
        }
        results.insert(result.id().to_string(), result);
    }

    async fn shutdown(&self) {
        self.token.cancel();
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(member = %self.name(), error = %e, "Dispatcher task failed");
            }
        }
        self.proxy.stop().await;
    }
}

struct GroupShared {
    name: String,
    config: GroupConfig,
    transport: TransportContext,
    bootstrap: Arc<dyn Bootstrap>,
    members: RwLock<Vec<Arc<Member>>>,
    filed: Arc<Notify>,
    token: CancellationToken,
    started: AtomicBool,
    stopped: AtomicBool,
    failure: Mutex<Option<LivenessFailure>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl GroupShared {
    fn snapshot(&self) -> Vec<Arc<Member>> {
        self.members.read().clone()
    }

    fn ensure_usable(&self) -> Result<()> {
        if let Some(failure) = self.failure.lock().as_ref() {
            return Err(KernelError::GroupFailed {
                group: self.name.clone(),
                reason: format!(
                    "member {} unhealthy for {:?}",
                    failure.member, failure.unhealthy_for
                ),
            });
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(KernelError::Stopped);
        }
        Ok(())
    }

    fn fail(&self, failure: LivenessFailure) {
        *self.failure.lock() = Some(failure);
        self.token.cancel();
        self.filed.notify_waiters();
    }
}

/// A named set of members driven together.
pub struct Group {
    shared: Arc<GroupShared>,
}

impl Group {
    pub fn new(
        name: impl Into<String>,
        config: GroupConfig,
        transport: TransportContext,
        bootstrap: Arc<dyn Bootstrap>,
    ) -> Self {
        Self {
            shared: Arc::new(GroupShared {
                name: name.into(),
                config,
                transport,
                bootstrap,
                members: RwLock::new(Vec::new()),
                filed: Arc::new(Notify::new()),
                token: CancellationToken::new(),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                failure: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Build a group and its members from a config section.
    pub fn from_config(
        name: impl Into<String>,
        conf: &GroupConf,
        transport: TransportContext,
        bootstrap: Arc<dyn Bootstrap>,
    ) -> Result<Self> {
        let group = Self::new(name, conf.to_group_config(), transport, bootstrap);
        for spec in conf.member_specs() {
            group.add_member(spec)?;
        }
        Ok(group)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn add_member(&self, spec: MemberSpec) -> Result<()> {
        let shared = &self.shared;
        let member = {
            let mut members = shared.members.write();
            if members.iter().any(|m| m.name() == spec.name) {
                return Err(KernelError::DuplicateMember(spec.name));
            }
            let member = Arc::new(Member::new(spec, &shared.config, &shared.transport, &shared.token));
            members.push(member.clone());
            member
        };
        info!(group = %shared.name, member = %member.name(), address = %member.spec.address, "Member added");
        if shared.started.load(Ordering::SeqCst) {
            member.launch(shared.filed.clone());
        }
        Ok(())
    }

    /// Remove a member, stopping its dispatcher and proxy. Its results go with it.
    pub async fn remove_member(&self, name: &str) -> Result<()> {
        let member = {
            let mut members = self.shared.members.write();
            let index = members
                .iter()
                .position(|m| m.name() == name)
                .ok_or_else(|| KernelError::UnknownMember(name.to_string()))?;
            members.remove(index)
        };
        member.shutdown().await;
        self.shared.filed.notify_waiters();
        info!(group = %self.shared.name, member = %name, "Member removed");
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shared.members.read().iter().any(|m| m.name() == name)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.shared.members.read().iter().map(|m| m.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.shared.members.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start proxies, dispatchers and the supervisor. Later calls do nothing.
    pub fn start(&self) {
        let shared = &self.shared;
        if shared.stopped.load(Ordering::SeqCst) || shared.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let members = shared.snapshot();
        for member in &members {
            member.launch(shared.filed.clone());
        }
        let supervisor = tokio::spawn(run_supervisor(shared.clone()));
        *shared.supervisor.lock() = Some(supervisor);
        info!(group = %shared.name, members = members.len(), policy = ?shared.config.policy, "Group started");
    }

    /// Queue `command` on every member; starts the group on first use.
    pub fn give_command(&self, command: Command) -> Result<()> {
        self.shared.ensure_usable()?;
        self.start();
        for member in self.shared.snapshot() {
            member.outstanding.fetch_add(1, Ordering::SeqCst);
            if member.queue_tx.send(command.clone()).is_err() {
                member.outstanding.fetch_sub(1, Ordering::SeqCst);
                return Err(KernelError::Stopped);
            }
        }
        debug!(group = %self.shared.name, command_id = command.id(), "Command given");
        Ok(())
    }

    /// Results for `command` from every current member, keyed by member name.
    ///
    /// Waits until each member has filed one. Results stay filed until
    /// [`Group::forget`].
    pub async fn hear_rant(&self, command: &Command) -> Result<HashMap<String, CommandResult>> {
        let shared = &self.shared;
        loop {
            let filed = shared.filed.notified();
            tokio::pin!(filed);
            filed.as_mut().enable();

            shared.ensure_usable()?;
            if let Some(results) = self.collect(command.id()) {
                return Ok(results);
            }

            tokio::select! {
                _ = &mut filed => {}
                _ = sleep(shared.config.poll_interval) => {}
                _ = shared.token.cancelled() => {}
            }
        }
    }

    /// [`Group::hear_rant`] bounded by `limit`.
    pub async fn hear_rant_within(&self, command: &Command, limit: Duration) -> Result<HashMap<String, CommandResult>> {
        tokio::time::timeout(limit, self.hear_rant(command))
            .await
            .map_err(|_| KernelError::Timeout(limit))?
    }

    fn collect(&self, id: &str) -> Option<HashMap<String, CommandResult>> {
        let mut collected = HashMap::new();
        for member in self.shared.snapshot() {
            let result = member.results.lock().get(id).cloned()?;
            collected.insert(member.name().to_string(), result);
        }
        Some(collected)
    }

    /// Drop the filed results of `id` from every member.
    pub fn forget(&self, id: &str) {
        for member in self.shared.snapshot() {
            member.results.lock().remove(id);
        }
    }

    /// Run the bootstrap for every member concurrently.
    pub async fn install_all(&self) -> HashMap<String, std::result::Result<(), BootstrapError>> {
        let members = self.shared.snapshot();
        let bootstrap = &self.shared.bootstrap;
        let outcomes = join_all(members.iter().map(|member| async move {
            let outcome = bootstrap.ensure_agent_running(&member.spec).await;
            match &outcome {
                Ok(()) => info!(group = %self.shared.name, member = %member.name(), "Agent installed"),
                Err(e) => warn!(group = %self.shared.name, member = %member.name(), error = %e, "Agent install failed"),
            }
            (member.name().to_string(), outcome)
        }))
        .await;
        outcomes.into_iter().collect()
    }

    pub fn status(&self) -> GroupHealth {
        let shared = &self.shared;
        let members = shared
            .snapshot()
            .iter()
            .map(|member| MemberHealth {
                name: member.name().to_string(),
                address: member.spec.address.to_string(),
                status: member.proxy.heartbeat_status(),
                last_healthy: *member.last_healthy_at.lock(),
                outstanding_commands: member.outstanding.load(Ordering::SeqCst),
                filed_results: member.results.lock().len(),
            })
            .collect();
        GroupHealth {
            group: shared.name.clone(),
            started: shared.started.load(Ordering::SeqCst),
            stopped: shared.stopped.load(Ordering::SeqCst),
            failure: self.fatal_error().map(|e| e.to_string()),
            members,
        }
    }

    /// The liveness failure that ended a strict group, if any.
    pub fn fatal_error(&self) -> Option<KernelError> {
        self.shared.failure.lock().as_ref().map(|failure| KernelError::LivenessTimeout {
            group: self.shared.name.clone(),
            member: failure.member.clone(),
            unhealthy_for: failure.unhealthy_for,
        })
    }

    /// Stop every task of the group. Pending `hear_rant` calls return `Stopped`.
    pub async fn stop(&self) {
        let shared = &self.shared;
        if shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.token.cancel();
        shared.filed.notify_waiters();

        let supervisor = shared.supervisor.lock().take();
        if let Some(supervisor) = supervisor {
            if let Err(e) = supervisor.await {
                error!(group = %shared.name, error = %e, "Supervisor task failed");
            }
        }
        join_all(shared.snapshot().iter().map(|member| member.shutdown())).await;
        info!(group = %shared.name, "Group stopped");
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.shared.token.cancel();
    }
}

/// Drain one member's queue in order, one command at a time.
async fn run_dispatcher(member: Arc<Member>, mut queue: mpsc::UnboundedReceiver<Command>, filed: Arc<Notify>) {
    loop {
        let command = tokio::select! {
            biased;
            _ = member.token.cancelled() => break,
            command = queue.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let result = match member.proxy.submit_and_await(&command).await {
            Ok(result) => result,
            Err(e) => {
                member.proxy.mark_unhealthy();
                warn!(member = %member.name(), command_id = command.id(), error = %e, "Command not delivered");
                CommandResult::undelivered(&command, e.to_string())
            }
        };
        if result.is_noteworthy_failure() {
            info!(member = %member.name(), command_id = result.id(), exit_code = ?result.exit_code(), "Command failed");
        }
        member.file(result);
        member.outstanding.fetch_sub(1, Ordering::SeqCst);
        filed.notify_waiters();
    }
    debug!(member = %member.name(), "Dispatcher stopped");
}

async fn run_supervisor(shared: Arc<GroupShared>) {
    let mut tracker = LivenessTracker::new(shared.config.member_timeout);
    let mut ticker = interval(shared.config.supervisor_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shared.token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let members = shared.snapshot();
        tracker.retain(|name| members.iter().any(|m| m.name() == name));
        let now = Instant::now();

        for member in &members {
            let status = member.proxy.heartbeat_status();
            if status == HeartbeatStatus::Healthy {
                *member.last_healthy_at.lock() = Some(OffsetDateTime::now_utc());
            }
            let Verdict::Remediate { unhealthy_for } = tracker.observe(member.name(), status, now) else {
                continue;
            };

            match shared.config.policy {
                LivenessPolicy::Restart => {
                    warn!(group = %shared.name, member = %member.name(), ?unhealthy_for, "Member unresponsive, restarting its agent");
                    // whatever it was running died with it
                    member.proxy.abandon_in_flight();
                    let bootstrap = shared.bootstrap.clone();
                    let spec = member.spec.clone();
                    tokio::spawn(async move {
                        match bootstrap.ensure_agent_running(&spec).await {
                            Ok(()) => info!(member = %spec.name, "Agent restarted"),
                            Err(e) => error!(member = %spec.name, error = %e, "Agent restart failed"),
                        }
                    });
                }
                LivenessPolicy::Strict => {
                    error!(group = %shared.name, member = %member.name(), ?unhealthy_for, "Member unresponsive, failing the group");
                    shared.fail(LivenessFailure {
                        member: member.name().to_string(),
                        unhealthy_for,
                    });
                    return;
                }
            }
        }
    }
    debug!(group = %shared.name, "Supervisor stopped");
}
