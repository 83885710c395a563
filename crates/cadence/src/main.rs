//! Cadence: content-distribution task scheduler.
//!
//! Main binary with subcommands:
//! - `daemon`: run the polling worker loop against an in-memory store

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Parse boolean from a flag or environment variable, accepting common
/// truthy values.
fn parse_bool(s: &str) -> Result<bool, String> {
    match s.to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(format!(
            "invalid boolean value '{}', expected 1/true/yes/on or 0/false/no/off",
            s
        )),
    }
}

mod daemon;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Content-distribution task scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker loop with development handlers
    Daemon {
        /// Poll interval in seconds
        #[arg(long, env = "CADENCE_POLL_INTERVAL", default_value = "10")]
        poll_interval: u64,

        /// Maximum concurrently executing tasks
        #[arg(long, env = "CADENCE_MAX_CONCURRENT", default_value = "4")]
        max_concurrent: usize,

        /// Per-task execution timeout in seconds
        #[arg(long, env = "CADENCE_TASK_TIMEOUT", default_value = "60")]
        task_timeout: u64,

        /// Retry budget stamped onto new tasks
        #[arg(long, env = "CADENCE_MAX_RETRIES", default_value = "3")]
        max_retries: u32,

        /// Base retry delay in seconds
        #[arg(long, env = "CADENCE_RETRY_BASE_DELAY", default_value = "300")]
        retry_base_delay: u64,

        /// Double the retry delay on each failure (capped at one hour)
        #[arg(long, env = "CADENCE_EXPONENTIAL_BACKOFF", value_parser = parse_bool, default_value = "true")]
        exponential_backoff: bool,

        /// Scheduling buffer between same customer/platform tasks, in
        /// minutes
        #[arg(long, env = "CADENCE_BUFFER_MINUTES", default_value = "15")]
        buffer_minutes: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cadence=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            poll_interval,
            max_concurrent,
            task_timeout,
            max_retries,
            retry_base_delay,
            exponential_backoff,
            buffer_minutes,
        } => {
            daemon::run(daemon::DaemonConfig {
                poll_interval,
                max_concurrent,
                task_timeout,
                max_retries,
                retry_base_delay,
                exponential_backoff,
                buffer_minutes,
            })
            .await
        }
    }
}
