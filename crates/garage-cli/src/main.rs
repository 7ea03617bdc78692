//! Garage CLI
//!
//! Operator tool for the garage local store: inspect records and the outbox,
//! act on failed changes, and run sync passes by hand.

use std::fs::OpenOptions;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use garage_core::{Config, Store};

mod commands;
mod output;

use output::{Output, OutputFormat};

#[derive(Parser)]
#[command(name = "garage")]
#[command(about = "Garage - offline-first records for a repair shop")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Quiet mode - minimal output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Use this config file instead of the default
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show storage, outbox and sync status
    Status,
    /// List local records in a container
    #[command(alias = "ls")]
    Records {
        /// Container name (customers, jobs, ledger_entries, ...)
        container: String,
        /// Owner whose records to show
        #[arg(long)]
        owner: String,
        /// Show a single record
        #[arg(long)]
        id: Option<String>,
    },
    /// Inspect queued changes
    Outbox {
        #[command(subcommand)]
        command: Option<OutboxCommands>,
    },
    /// Send queued changes, then pull every container
    Sync {
        /// Owner whose records to pull
        #[arg(long)]
        owner: String,
    },
    /// Pull every container from the remote
    Pull {
        /// Owner whose records to pull
        #[arg(long)]
        owner: String,
    },
    /// Send queued changes once
    Drain,
    /// Show or set configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
enum OutboxCommands {
    /// List queued changes
    #[command(alias = "ls")]
    List {
        /// Show failed changes instead of pending ones
        #[arg(long)]
        failed: bool,
    },
    /// Put a failed change back into the queue
    Retry {
        /// Outbox entry ID
        id: String,
    },
    /// Drop a failed change
    #[command(alias = "rm")]
    Discard {
        /// Outbox entry ID
        id: String,
    },
}

#[derive(Subcommand, Clone)]
enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (data_dir, remote_url, sync_enabled, ...)
        key: String,
        /// Configuration value
        value: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let output = Output::new(OutputFormat::from_flags(cli.json, cli.quiet));

    // Config commands don't need the store
    if let Commands::Config { command } = &cli.command {
        return handle_config_command(command.clone(), cli.config.as_ref(), &output);
    }

    let config = Config::load_with_cli_override(cli.config.as_ref())
        .context("Failed to load configuration")?;
    init_logging(&config, cli.verbose);

    // Background refreshes would be cut off when the process exits
    let store = Store::open(&config).await?.with_refresh_on_read(false);

    let result = match cli.command {
        Commands::Status => commands::status::show(&store, &config, &output).await,
        Commands::Records {
            container,
            owner,
            id,
        } => commands::records::list(&store, &container, &owner, id, &output).await,
        Commands::Outbox { command } => handle_outbox_command(command, &store, &output).await,
        Commands::Sync { owner } => commands::sync::sync(&store, &config, &owner, &output).await,
        Commands::Pull { owner } => commands::sync::pull(&store, &config, &owner, &output).await,
        Commands::Drain => commands::sync::drain(&store, &config, &output).await,
        Commands::Config { .. } => unreachable!(), // Handled above
    };

    store.close().await;
    result
}

async fn handle_outbox_command(
    command: Option<OutboxCommands>,
    store: &Store,
    output: &Output,
) -> Result<()> {
    match command {
        Some(OutboxCommands::List { failed }) => {
            commands::outbox::list(store, failed, output).await
        }
        None => commands::outbox::list(store, false, output).await,
        Some(OutboxCommands::Retry { id }) => commands::outbox::retry(store, id, output).await,
        Some(OutboxCommands::Discard { id }) => commands::outbox::discard(store, id, output).await,
    }
}

fn handle_config_command(
    command: Option<ConfigCommands>,
    config_path: Option<&PathBuf>,
    output: &Output,
) -> Result<()> {
    match command {
        Some(ConfigCommands::Show) | None => commands::config::show(config_path, output),
        Some(ConfigCommands::Set { key, value }) => {
            commands::config::set(key, value, config_path, output)
        }
    }
}

/// Set up tracing
///
/// `RUST_LOG` wins over `-v`. Logs go to `log_file` when configured,
/// stderr otherwise.
fn init_logging(config: &Config, verbose: u8) {
    let env_filter = match std::env::var("RUST_LOG") {
        Ok(filter) => EnvFilter::new(filter),
        Err(_) => {
            let log_level = match verbose {
                0 => "warn",
                1 => "info",
                2 => "debug",
                _ => "trace",
            };
            EnvFilter::new(format!(
                "garage_core={},garage_cli={}",
                log_level, log_level
            ))
        }
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    let Some(ref log_path) = config.log_file else {
        // Ignore error if already initialized
        let _ = builder.with_writer(std::io::stderr).try_init();
        return;
    };

    match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(log_file) => {
            let _ = builder.with_ansi(false).with_writer(log_file).try_init();
            info!("Logging to {:?}", log_path);
        }
        Err(e) => {
            eprintln!("Warning: Could not open log file {:?}: {}", log_path, e);
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_outbox_retry() {
        let cli = Cli::try_parse_from(["garage", "--json", "outbox", "retry", "m-1"]).unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Outbox {
                command: Some(OutboxCommands::Retry { id }),
            } => assert_eq!(id, "m-1"),
            _ => panic!("expected outbox retry"),
        }
    }

    #[test]
    fn test_records_requires_owner() {
        assert!(Cli::try_parse_from(["garage", "records", "customers"]).is_err());

        let cli = Cli::try_parse_from(["garage", "records", "customers", "--owner", "u1", "-vv"])
            .unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Records { .. }));
    }
}
