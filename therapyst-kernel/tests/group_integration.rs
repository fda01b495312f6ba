mod common;

use common::{fast_config, RecordingBootstrap};
use std::collections::BTreeSet;
use std::time::Duration;
use therapyst_devkit::{wait_until, MockAgent, TestHarness};
use therapyst_kernel::{Group, HeartbeatStatus, LivenessPolicy, MemberSpec, NodeProxy, ProxyConfig};
use therapyst_wire::{Command, CommandKind, CommandResult, TransportContext, UNKNOWN_ADVICE};

const LIMIT: Duration = Duration::from_secs(15);

fn group(name: &str) -> Group {
    Group::new(
        name,
        fast_config(LivenessPolicy::Restart),
        TransportContext::default(),
        RecordingBootstrap::new(),
    )
}

#[tokio::test]
async fn test_give_and_hear_across_real_agents() {
    let mut harness = TestHarness::new();
    let node1 = harness.spawn_agent("node1", 2).await.unwrap();
    let node2 = harness.spawn_agent("node2", 2).await.unwrap();

    let group = group("lab");
    group.add_member(MemberSpec::new("node1", node1)).unwrap();
    group.add_member(MemberSpec::new("node2", node2)).unwrap();

    let command = Command::with_id("abc", "ls -ahl", CommandKind::Shell);
    group.give_command(command.clone()).unwrap();
    let results = group.hear_rant_within(&command, LIMIT).await.unwrap();

    let names: BTreeSet<_> = results.keys().cloned().collect();
    assert_eq!(names, BTreeSet::from(["node1".to_string(), "node2".to_string()]));
    for result in results.values() {
        assert_eq!(result.id(), "abc");
        assert_eq!(result.exit_code(), Some(0));
        assert!(!result.output().is_empty());
    }

    // unknown kinds come back as data, not errors
    let odd = Command::with_id("odd-1", "whatever", CommandKind::Unknown("reboot".into()));
    group.give_command(odd.clone()).unwrap();
    let results = group.hear_rant_within(&odd, LIMIT).await.unwrap();
    for result in results.values() {
        assert_eq!(result.output(), UNKNOWN_ADVICE);
        assert_eq!(result.exit_code(), Some(1));
    }

    group.stop().await;
    harness.stop_all().await;
}

#[tokio::test]
async fn test_member_added_after_start() {
    let mut harness = TestHarness::new();
    let node1 = harness.spawn_agent("node1", 1).await.unwrap();
    let node2 = harness.spawn_agent("node2", 1).await.unwrap();

    let group = group("late");
    group.add_member(MemberSpec::new("node1", node1)).unwrap();
    group.start();
    group.add_member(MemberSpec::new("node2", node2)).unwrap();

    let command = Command::shell("echo hello");
    group.give_command(command.clone()).unwrap();
    let results = group.hear_rant_within(&command, LIMIT).await.unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results["node2"].output().trim(), "hello");

    group.remove_member("node1").await.unwrap();
    assert_eq!(group.member_names(), vec!["node2"]);

    group.stop().await;
    harness.stop_all().await;
}

#[tokio::test]
async fn test_commands_reach_each_member_in_order() {
    let first = MockAgent::start().await.unwrap();
    let second = MockAgent::start().await.unwrap();

    let group = group("fifo");
    group.add_member(MemberSpec::new("first", first.address())).unwrap();
    group.add_member(MemberSpec::new("second", second.address())).unwrap();

    let commands: Vec<Command> = (0..5).map(|i| Command::shell(format!("step {i}"))).collect();
    for command in &commands {
        group.give_command(command.clone()).unwrap();
    }
    for command in &commands {
        let results = group.hear_rant_within(command, LIMIT).await.unwrap();
        assert_eq!(results["first"].output(), format!("mock: {}", command.command_line()));
    }

    let expected: Vec<_> = commands.iter().map(|c| c.id().to_string()).collect();
    for agent in [&first, &second] {
        let seen: Vec<_> = agent.commands().iter().map(|c| c.id().to_string()).collect();
        assert_eq!(seen, expected);
    }

    group.stop().await;
    first.stop().await;
    second.stop().await;
}

#[tokio::test]
async fn test_duplicate_result_keeps_first() {
    let agent = MockAgent::start().await.unwrap();
    agent.set_auto_complete(false);

    let group = group("dups");
    group.add_member(MemberSpec::new("node1", agent.address())).unwrap();

    let command = Command::with_id("abc", "ls -ahl", CommandKind::Shell);
    group.give_command(command.clone()).unwrap();
    assert!(wait_until(LIMIT, || !agent.commands().is_empty()).await);

    agent.push_result(CommandResult::completed(&command, "first", Some(0))).unwrap();
    agent.push_result(CommandResult::completed(&command, "second", Some(0))).unwrap();

    let results = group.hear_rant_within(&command, LIMIT).await.unwrap();
    assert_eq!(results["node1"].output(), "first");
    assert!(wait_until(LIMIT, || agent.result_acks().len() == 2).await);

    let results = group.hear_rant_within(&command, LIMIT).await.unwrap();
    assert_eq!(results["node1"].output(), "first");

    group.stop().await;
    agent.stop().await;
}

#[tokio::test]
async fn test_rejected_command_is_filed_as_undelivered() {
    let agent = MockAgent::start().await.unwrap();
    agent.set_accepting(false);

    let group = group("busy");
    group.add_member(MemberSpec::new("node1", agent.address())).unwrap();

    let command = Command::shell("uptime");
    group.give_command(command.clone()).unwrap();
    let results = group.hear_rant_within(&command, LIMIT).await.unwrap();
    let result = &results["node1"];
    assert_eq!(result.id(), command.id());
    assert_eq!(result.exit_code(), None);
    assert!(result.output().contains("did not accept"));

    group.stop().await;
    agent.stop().await;
}

#[tokio::test]
async fn test_heartbeat_answered_while_worker_busy() {
    let mut harness = TestHarness::new();
    let node = harness.spawn_agent("slow", 1).await.unwrap();

    let proxy = NodeProxy::new("slow", node, ProxyConfig::default(), TransportContext::default());
    for _ in 0..3 {
        assert!(proxy.submit_command(&Command::shell("sleep 1")).await.unwrap());
    }

    let status = tokio::time::timeout(Duration::from_millis(500), proxy.probe_heartbeat())
        .await
        .unwrap();
    assert_eq!(status, HeartbeatStatus::Healthy);
    assert_eq!(proxy.heartbeat_status(), HeartbeatStatus::Healthy);

    proxy.stop().await;
    harness.stop_all().await;
}

#[tokio::test]
async fn test_proxy_submit_and_await_with_real_agent() {
    let mut harness = TestHarness::new();
    let node = harness.spawn_agent("node1", 2).await.unwrap();

    let proxy = NodeProxy::new("node1", node, ProxyConfig::default(), TransportContext::default());
    proxy.start();
    proxy.start();

    let command = Command::shell("sh -c 'exit 7'").expecting_error();
    let result = proxy.submit_and_await(&command).await.unwrap();
    assert_eq!(result.id(), command.id());
    assert_eq!(result.exit_code(), Some(7));
    assert!(!result.is_noteworthy_failure());

    assert!(wait_until(LIMIT, || proxy.heartbeat_status() == HeartbeatStatus::Healthy).await);

    proxy.stop().await;
    harness.stop_all().await;
}
