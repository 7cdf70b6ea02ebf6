//! meshd — the FlowMesh daemon.
//!
//! Runs in one of two modes: `agent` discovers local topology, samples
//! flows at requested capture points, and publishes both; `analyzer`
//! aggregates the per-agent graphs and persists flow records behind the
//! query language.

mod agent;
mod analyzer;
mod replication;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshd", about = "FlowMesh topology and flow observation daemon")]
struct Cli {
    /// Path to meshd.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the per-host agent.
    Agent,
    /// Run the central analyzer.
    Analyzer,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<mesh_core::config::MeshConfig> {
    match path {
        Some(path) => Ok(mesh_core::config::MeshConfig::from_file(path)?),
        None => Ok(mesh_core::config::MeshConfig::default()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Agent => agent::run_agent(config).await,
        Command::Analyzer => analyzer::run_analyzer(config).await,
    }
}
