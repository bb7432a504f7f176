//! t7 CLI
//!
//! Boards resumable terminal sessions to remote hosts:
//! - `t7 connect` opens a pane and attaches the local terminal
//! - `t7 config` manages the client configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use t7_cli::commands::{self, ConnectArgs};
use t7_cli::output::print_error;

#[derive(Parser)]
#[command(name = "t7")]
#[command(author, version, about = "Resumable remote terminal sessions over WebRTC and SSH")]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a host and attach to a pane
    Connect(ConnectArgs),

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
    /// Get specific config value
    Get { key: String },
    /// Set config value
    Set { key: String, value: String },
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (false, 0) => "warn",
        (false, 1) => "info",
        (false, 2) => "debug",
        (false, _) => "trace",
    };

    // stdout belongs to the remote terminal while attached
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config_path = cli.config.as_ref();
    match cli.command {
        Commands::Connect(args) => {
            let config = commands::load(config_path)?;
            if let Err(e) = commands::connect_command(&config, args).await {
                print_error(&format!("{:#}", e));
                std::process::exit(1);
            }
        }

        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_show(config_path)?,
            ConfigAction::Init { force } => commands::config_init(config_path, force)?,
            ConfigAction::Get { key } => commands::config_get(config_path, &key)?,
            ConfigAction::Set { key, value } => commands::config_set(config_path, &key, &value)?,
            ConfigAction::Path => commands::config_path(config_path)?,
        },
    }

    Ok(())
}
