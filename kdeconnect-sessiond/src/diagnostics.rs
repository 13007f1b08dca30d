//! Command Line and Logging
//!
//! Command-line interface of the session daemon and logging setup.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

/// KDE Connect session daemon command-line interface
#[derive(Parser, Debug)]
#[command(name = "kdeconnect-sessiond")]
#[command(about = "KDE Connect device session daemon", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Show timestamps in logs
    #[arg(long, value_name = "BOOL", default_value_t = true, action = ArgAction::Set)]
    pub timestamps: bool,

    /// Connect to a peer on start, such as tcp://192.168.1.20:1716
    #[arg(long = "connect", value_name = "URI")]
    pub connect: Vec<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Daemon commands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the daemon until interrupted (default)
    Run,

    /// List paired devices known to this host
    ListDevices {
        /// Show capabilities as well
        #[arg(long)]
        verbose: bool,
    },

    /// Print the effective configuration
    DumpConfig,
}

impl Cli {
    /// Subcommand to execute
    pub fn subcommand(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}

/// Initialize logging based on CLI configuration
///
/// `RUST_LOG` takes precedence over `--log-level`.
pub fn init_logging(cli: &Cli) -> Result<()> {
    let log_level = cli.log_level.parse::<Level>().with_context(|| {
        format!(
            "Invalid log level '{}'. Valid levels: error, warn, info, debug, trace",
            cli.log_level
        )
    })?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.as_str()))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(true)
        .with_line_number(true);

    match (cli.json_logs, cli.timestamps) {
        (true, true) => subscriber.json().init(),
        (true, false) => subscriber.without_time().json().init(),
        (false, true) => subscriber.init(),
        (false, false) => subscriber.without_time().init(),
    }

    info!(
        "Logging initialized: level={}, json={}, timestamps={}",
        log_level, cli.json_logs, cli.timestamps
    );

    Ok(())
}
