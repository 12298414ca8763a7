//! CLI module — command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod check;
pub mod remote;
pub mod up;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};

use stackd::config::Config;

#[derive(Parser)]
#[command(name = "stackd")]
#[command(version)]
#[command(about = "Local service-lifecycle coordinator", long_about = None)]
struct Cli {
    /// Daemon config file (defaults to ~/.stackd/config.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every service in the topology and keep it running until Ctrl+C
    Up {
        /// Topology file (YAML or JSON)
        file: PathBuf,
    },
    /// Validate a topology file and print its start order
    Check {
        /// Topology file (YAML or JSON)
        file: PathBuf,
    },
    /// Show the phase of every service of a running coordinator
    Status {
        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },
    /// Restart one service of a running coordinator
    Restart {
        /// Service name
        service: String,
    },
    /// Ask a running coordinator to stop every service and exit
    Down,
    /// Show version information
    Version,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Load config early so logging respects it; remote commands fall back to
    // defaults when the file is unreadable, `up` reports the error.
    let loaded = match &cli.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };
    let logging_cfg = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    if let Err(e) = stackd::utils::logging::init_logging(&logging_cfg) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Version) => {
            cmd_version();
        }
        Some(Commands::Up { file }) => {
            let config = loaded.with_context(|| "Failed to load configuration")?;
            up::cmd_up(&file, config).await?;
        }
        Some(Commands::Check { file }) => {
            check::cmd_check(&file)?;
        }
        Some(Commands::Status { json }) => {
            remote::cmd_status(&loaded.unwrap_or_default(), json).await?;
        }
        Some(Commands::Restart { service }) => {
            remote::cmd_restart(&loaded.unwrap_or_default(), &service).await?;
        }
        Some(Commands::Down) => {
            remote::cmd_down(&loaded.unwrap_or_default()).await?;
        }
    }

    Ok(())
}

fn cmd_version() {
    println!("stackd {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Local service-lifecycle coordinator");
}
