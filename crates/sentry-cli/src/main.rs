//! Sentry CLI - request SPIFFE workload certificates from the sentry CA
//!
//! # Examples
//!
//! ```bash
//! # Request a certificate for the "default" namespace
//! sentry request --namespace default > chain.pem
//!
//! # Also print the private key
//! sentry request --namespace default --print-key
//!
//! # Show which deployment mode and token validator would be used
//! sentry detect
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod detect;
mod request;

/// Sentry CLI - workload certificate bootstrap
#[derive(Parser)]
#[command(name = "sentry")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "SENTRY_CONFIG")]
    #[arg(default_value = "~/.config/sentry/config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Request a workload certificate and print it
    Request(request::RequestArgs),

    /// Show the detected deployment mode and token validator
    Detect,

    /// Show current configuration
    Config,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sentry=debug,info"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sentry=info,warn"))
    };

    // stdout carries certificate material; logs go to stderr.
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = shellexpand::tilde(&cli.config).to_string();
    debug!(config_path = %config_path, "starting sentry cli");

    match cli.command {
        Commands::Request(args) => request::execute(args, &config_path).await,
        Commands::Detect => detect::execute(&config_path).await,
        Commands::Config => config::show(&config_path),
    }
}
