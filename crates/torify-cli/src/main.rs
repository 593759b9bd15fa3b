//! torify command-line interface
//!
//! Runs a private tor daemon from a data directory and exercises it: publish
//! an echo onion service or open an isolated stream through it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use torify_core::TorifyConfig;
use tracing_subscriber::EnvFilter;

mod commands;

/// torify - a supervised tor daemon for your application
#[derive(Parser)]
#[command(name = "torify")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Tor data directory (overrides the configuration file)
    #[arg(short, long)]
    tor_dir: Option<String>,

    /// Tor binary to stage (overrides the configuration file)
    #[arg(long)]
    tor_binary: Option<String>,

    /// Bridge line, may be repeated
    #[arg(long = "bridge")]
    bridges: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start tor, wait for bootstrap and run until Ctrl+C
    Start,

    /// Publish an onion service that echoes every line it receives
    Serve {
        /// Port on the onion address
        #[arg(long, default_value = "80")]
        virtual_port: u16,

        /// Local port tor forwards to
        #[arg(long, default_value = "8080")]
        local_port: u16,

        /// Directory for the service's hostname and key
        #[arg(long)]
        hs_dir: Option<String>,
    },

    /// Send one line through tor and print the reply
    Connect {
        /// Destination host (onion or clearnet)
        host: String,

        /// Destination port
        port: u16,

        /// Line to send
        #[arg(short, long, default_value = "hello")]
        message: String,

        /// Stream id; streams with different ids use different circuits
        #[arg(short, long)]
        stream_id: Option<String>,
    },
}

const DEFAULT_TOR_DIR: &str = "~/.torify";

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

fn load_config(cli: &Cli) -> Result<TorifyConfig> {
    let mut config = match &cli.config {
        Some(path) => TorifyConfig::load(expand(path))
            .with_context(|| format!("Failed to load configuration from {}", path))?,
        None => TorifyConfig::new(expand(DEFAULT_TOR_DIR)),
    };
    if let Some(tor_dir) = &cli.tor_dir {
        config.tor_dir = expand(tor_dir);
    }
    if let Some(tor_binary) = &cli.tor_binary {
        config.tor_binary = Some(expand(tor_binary));
    }
    config.bridges.extend(cli.bridges.iter().cloned());
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Start => {
            commands::start(config).await?;
        }
        Commands::Serve {
            virtual_port,
            local_port,
            hs_dir,
        } => {
            commands::serve(config, virtual_port, local_port, hs_dir.as_deref().map(expand)).await?;
        }
        Commands::Connect {
            host,
            port,
            message,
            stream_id,
        } => {
            commands::connect(config, &host, port, &message, stream_id.as_deref()).await?;
        }
    }

    Ok(())
}
