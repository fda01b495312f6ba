use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use therapyst_agent_host::{AgentConfig, AgentDaemon};
use tokio::time::interval;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "therapyst-agent-host", version, about = "Therapyst remote agent")]
struct Args {
    /// Path to the agent config (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command endpoint port
    #[arg(long)]
    port: Option<u16>,

    /// Result endpoint port
    #[arg(long)]
    result_port: Option<u16>,

    /// Number of worker tasks
    #[arg(long)]
    workers: Option<usize>,

    /// Interface to bind
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("therapyst_agent_host=info")),
        )
        .init();

    let args = Args::parse();
    let mut config = AgentConfig::load(args.config.as_deref())
        .await
        .context("Failed to load agent config")?;
    if let Some(port) = args.port {
        config.listen.command_port = port;
    }
    if let Some(port) = args.result_port {
        config.listen.result_port = port;
    }
    if let Some(workers) = args.workers {
        config.execution.workers = workers;
    }
    if let Some(bind) = args.bind {
        config.listen.bind_host = bind;
    }

    info!("Therapyst Agent Host starting...");
    let mut daemon = AgentDaemon::new(config);
    daemon.start().await.context("Failed to start agent")?;

    let mut stats_timer = interval(Duration::from_secs(60));
    stats_timer.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            _ = stats_timer.tick() => {
                let stats = daemon.stats();
                info!(
                    received = stats.commands_received,
                    heartbeats = stats.heartbeats_answered,
                    results = stats.results_sent,
                    "Agent stats"
                );
            }
        }
    }

    daemon.stop().await;
    Ok(())
}
