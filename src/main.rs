//! picoswitch CLI entry point.

use clap::{Parser, Subcommand};
use picoswitch::config::HostConfig;
use tracing_subscriber::EnvFilter;

mod cli;

/// picoswitch - toggle-switch control of a local inference container
#[derive(Parser, Debug)]
#[command(name = "picoswitch")]
#[command(about = "Toggle-switch control of a local inference container")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the host daemon (serial link + lifecycle controller).
    Run(cli::run::RunCmd),

    /// Query runtime state and memory once and print the status line.
    Stat(cli::stat::StatCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging();

    tracing::debug!(version = picoswitch::VERSION, "starting picoswitch");

    // Load configuration
    let config = match HostConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            HostConfig::default()
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Run(cmd) => cmd.run(config),
        Commands::Stat(cmd) => cmd.run(config),
    };

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("picoswitch=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
