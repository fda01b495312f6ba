/**
 * THERAPYST KERNEL - command line entry point
 *
 * Loads kernel.yaml, builds the requested group and either runs a command
 * across all of its members or reports their health.
 */

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use therapyst_kernel::config::{config_path, load_config};
use therapyst_kernel::{Group, KernelConfig};
use therapyst_wire::{Command, TransportContext};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "therapyst-kernel", version, about = "Run shell commands across a group of nodes")]
struct Cli {
    /// Kernel config (YAML); defaults to $THERAPYST_KERNEL_CONFIG or kernel.yaml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Group to address
    #[arg(long, global = true)]
    group: Option<String>,

    /// Command line to run on every member
    #[arg(long)]
    command: Option<String>,

    /// Run the command this many times
    #[arg(long, default_value_t = 1)]
    count: u32,

    /// Bootstrap every member before running
    #[arg(long)]
    install: bool,

    /// Give up waiting for results after this many seconds
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Probe the members of one group (or all groups) and print their health
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let path = config_path(cli.config.as_deref());
    let config = load_config(&path)
        .await
        .with_context(|| format!("Failed to load {}", path.display()))?;

    match cli.action {
        Some(Action::Status) => status(&config, cli.group.as_deref()).await,
        None => {
            let (Some(group), Some(command)) = (cli.group.as_deref(), cli.command.as_deref()) else {
                bail!("--group and --command are required unless a subcommand is given");
            };
            run(&config, group, command, cli.count, cli.install, Duration::from_secs(cli.timeout_secs)).await
        }
    }
}

fn build_group(config: &KernelConfig, name: &str) -> Result<Group> {
    let conf = config.group(name)?;
    let transport = TransportContext::new(config.transport.to_transport_config());
    Ok(Group::from_config(name, conf, transport, config.bootstrap())?)
}

async fn run(config: &KernelConfig, name: &str, line: &str, count: u32, install: bool, limit: Duration) -> Result<()> {
    let group = build_group(config, name)?;
    if group.is_empty() {
        warn!(group = %name, "Group has no members");
    }

    if install {
        let failed: Vec<_> = group
            .install_all()
            .await
            .into_iter()
            .filter_map(|(member, outcome)| outcome.err().map(|e| (member, e)))
            .collect();
        for (member, e) in &failed {
            warn!(member = %member, error = %e, "Install failed");
        }
    }

    let commands: Vec<Command> = (0..count).map(|_| Command::shell(line)).collect();
    for command in &commands {
        group.give_command(command.clone())?;
    }
    info!(group = %name, count, "Commands given");

    let mut outcome = Ok(());
    for command in &commands {
        match group.hear_rant_within(command, limit).await {
            Ok(results) => {
                let sorted: BTreeMap<_, _> = results.into_iter().collect();
                println!("{}", serde_json::to_string_pretty(&sorted)?);
                group.forget(command.id());
            }
            Err(e) => {
                outcome = Err(anyhow::Error::new(e).context(format!("No complete results for {}", command.id())));
                break;
            }
        }
    }

    group.stop().await;
    outcome
}

async fn status(config: &KernelConfig, only: Option<&str>) -> Result<()> {
    let names: Vec<String> = match only {
        Some(name) => vec![name.to_string()],
        None => config.groups.keys().cloned().collect(),
    };

    let mut unhealthy = Vec::new();
    for name in names {
        let group = build_group(config, &name)?;
        group.start();
        let settle = config.group(&name)?.to_group_config().heartbeat_interval * 2;
        tokio::time::sleep(settle).await;

        let health = group.status();
        println!("{}", serde_json::to_string_pretty(&health)?);
        if health.is_healthy() {
            info!(group = %name, members = health.members.len(), "Group healthy");
        } else {
            warn!(group = %name, healthy = health.healthy_members(), members = health.members.len(), "Group not healthy");
            unhealthy.push(name);
        }
        group.stop().await;
    }

    if !unhealthy.is_empty() {
        bail!("unhealthy groups: {}", unhealthy.join(", "));
    }
    Ok(())
}
