//! Convoy daemon
//!
//! Runs the orchestration core with in-memory state. Without a cluster or
//! build backend attached, reconciles and builds are logged, not executed.
//!
//! ## Commands
//!
//! - `serve`: start the scheduler and sweeper until interrupted (default)
//! - `config`: print the effective configuration as TOML

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use convoy_core::build::{BuildResult, Builder};
use convoy_core::farm::BuildFarmClient;
use convoy_core::{
    telemetry, Collaborators, ControlPlane, ControlPlaneConfig, DryRunReconciler,
    HttpBuildFarmClient,
};
use convoy_state::{Service, StateStores};
use tracing::info;

#[derive(Parser)]
#[command(name = "convoyd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Convoy control-plane daemon", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true, env = "CONVOY_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Log level when RUST_LOG is not set (overrides the config file)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the control plane until interrupted
    Serve,

    /// Print the effective configuration
    Config,
}

/// Reports a successful build without running one.
struct DryRunBuilder;

#[async_trait]
impl Builder for DryRunBuilder {
    async fn build_from_git(&self, service: &Service, git_sha: &str) -> BuildResult {
        info!(service = %service.id, git_sha, "dry-run build");
        BuildResult::succeeded(format!("{}:{}", service.name, git_sha))
    }
}

fn load_config(cli: &Cli) -> Result<ControlPlaneConfig> {
    load_config_with(cli, |key| std::env::var(key).ok())
}

/// Config file, then `CONVOY_*` variables from `lookup`, then flags.
fn load_config_with(
    cli: &Cli,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<ControlPlaneConfig> {
    let mut config = ControlPlaneConfig::load_with(cli.config.as_deref(), lookup)
        .context("failed to load configuration")?;
    if cli.json {
        config.logging.json = true;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn serve(config: ControlPlaneConfig) -> Result<()> {
    let farm = HttpBuildFarmClient::from_config(&config)
        .context("failed to create build farm client")?
        .map(|client| Arc::new(client) as Arc<dyn BuildFarmClient>);
    if farm.is_some() {
        info!("build farm delegation enabled");
    }

    let control_plane = ControlPlane::new(
        &config,
        StateStores::in_memory(),
        Collaborators {
            reconciler: Arc::new(DryRunReconciler),
            builder: Arc::new(DryRunBuilder),
            farm,
        },
    )
    .await
    .context("failed to start control plane")?;

    control_plane.start();
    info!(version = env!("CARGO_PKG_VERSION"), "convoyd started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    control_plane.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    telemetry::init_from_config(&config.logging);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Config => {
            let rendered = toml::to_string_pretty(&config).context("failed to render config")?;
            println!("{rendered}");
            Ok(())
        }
    }
}
