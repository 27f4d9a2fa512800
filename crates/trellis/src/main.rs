//! The trellis agent binary: config file in, running mesh agent out.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trellis_core::{Agent, Identity, Settings};

mod mgmt;

#[derive(Parser)]
#[command(name = "trellis", version, about = "Userspace mesh-networking agent")]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(short, long, default_value = "trellis.toml", env = "TRELLIS_CONFIG")]
    config: PathBuf,

    /// Override the configured log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the agent (the default).
    Run,
    /// Print this agent's persistent id and exit.
    Id,
}

fn load_settings(path: &PathBuf) -> anyhow::Result<Settings> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let settings: Settings =
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("trellis={level},trellis_core={level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = load_settings(&cli.config)?;
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.agent.log_level.clone());
    init_tracing(&level);

    let identity = Identity::load_or_create(&settings.agent.data_dir)
        .context("loading identity from data_dir")?;
    if let Some(pinned) = &settings.agent.id {
        let pinned = pinned.parse().expect("validated: agent.id parses");
        anyhow::ensure!(
            identity.agent_id == pinned,
            "persisted identity {} does not match configured agent.id {}",
            identity.agent_id,
            pinned
        );
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Id => {
            println!("{}", identity.agent_id);
            Ok(())
        }
        Command::Run => run(settings, identity).await,
    }
}

async fn run(settings: Settings, identity: Identity) -> anyhow::Result<()> {
    let mgmt_cfg = settings.management.clone();
    let agent = Arc::new(Agent::start(settings, identity).await?);

    if mgmt_cfg.enabled {
        let addr: SocketAddr = mgmt_cfg.address.parse().expect("validated: management address");
        let agent = agent.clone();
        tokio::spawn(async move {
            if let Err(e) = mgmt::serve(agent, addr).await {
                tracing::error!(error = %e, "management surface failed");
            }
        });
    }

    wait_for_signal().await;
    agent.shutdown().await;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
