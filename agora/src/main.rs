//! Agora CLI
//!
//! # Usage
//!
//! ```bash
//! # Run the configured agents on an in-process broker until Ctrl-C
//! agora run
//!
//! # Print the effective configuration
//! agora --config ./agora.toml config show
//!
//! # Write a default configuration file
//! agora config init ./agora.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::info;

use agora::bus::MemoryBroker;
use agora::config::{AgoraConfig, DEFAULT_CONFIG_FILE};
use agora::manager::AgentManager;

#[derive(Parser)]
#[command(name = "agora")]
#[command(about = "Agora - Multi-Agent Envelope Runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (default: ./agora.toml when present)
    #[arg(short, long, global = true, env = "AGORA_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured agents and run until interrupted
    Run,

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,

    /// Write a default configuration file
    Init {
        /// Target path
        #[arg(default_value = DEFAULT_CONFIG_FILE)]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Run => {
            let config = load_config(cli.config.as_deref())?;
            run_agents(config).await
        }
        Commands::Config(ConfigCommands::Show) => {
            let config = load_config(cli.config.as_deref())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Commands::Config(ConfigCommands::Init { path, force }) => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            AgoraConfig::default().save_to_path(&path)?;
            println!("Wrote default configuration to {}", path.display());
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> Result<AgoraConfig> {
    match path {
        Some(path) => AgoraConfig::load_from_path(path),
        None => AgoraConfig::load(),
    }
}

async fn run_agents(config: AgoraConfig) -> Result<()> {
    let broker = match config.runtime.broker_retention {
        Some(retention) => MemoryBroker::new().with_retention(retention),
        None => MemoryBroker::new(),
    };

    let manager = AgentManager::new(Arc::new(broker), config);
    manager.start().await.context("Failed to start agent manager")?;

    for agent in manager.agent_infos().await {
        info!("{} ({}) capabilities={:?}", agent.name, agent.id, agent.capabilities);
    }
    info!("Agora {} running, press Ctrl-C to stop", agora::VERSION);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    manager.stop().await.context("Failed to stop agent manager")?;
    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if verbose {
        EnvFilter::new("agora=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("agora=info,warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
