//! AegisShield operator CLI.
//!
//! Starts the worker processes (`run <service>`) and performs
//! administrative operations (`admin <command>`). Exit codes: 0 success,
//! 1 configuration error, 2 fatal startup error, 3 interrupted.

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{admin, run};

const EXIT_CONFIG: u8 = 1;
const EXIT_STARTUP: u8 = 2;
const EXIT_INTERRUPTED: u8 = 3;

#[derive(Parser)]
#[command(name = "aegis")]
#[command(version)]
#[command(about = "AegisShield core pipeline operator CLI")]
#[command(long_about = "
AegisShield operator CLI

Starts the analytical pipeline workers and performs administrative
operations against the graph and audit stores.

Examples:
  aegis run ingest-service
  aegis run pattern-service
  aegis admin migrate
  aegis admin backfill --from 2026-07-01T00:00:00Z --to 2026-07-08T00:00:00Z
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a worker process
    #[command(subcommand)]
    Run(RunCommands),

    /// Administrative operations
    #[command(subcommand)]
    Admin(AdminCommands),
}

#[derive(Subcommand)]
pub enum RunCommands {
    /// Consume raw submissions, validate, persist, emit
    IngestService,
    /// Serve analytics requests over the bus
    GraphService,
    /// Periodically scan for suspicious patterns
    PatternService {
        /// Seconds between detection sweeps
        #[arg(long, default_value = "60")]
        scan_interval: u64,
    },
    /// Consume detections into alerts and investigations
    AlertService,
}

#[derive(Subcommand)]
pub enum AdminCommands {
    /// Create or update database schemas
    Migrate,
    /// Re-run detection over a historical window
    Backfill {
        /// Window start (RFC 3339)
        #[arg(long)]
        from: chrono::DateTime<chrono::Utc>,
        /// Window end (RFC 3339)
        #[arg(long)]
        to: chrono::DateTime<chrono::Utc>,
    },
    /// Rebuild the entity resolver index from the graph
    Reindex,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match aegis_core::AegisConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "configuration error:".red().bold(), e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("{} {}", "startup error:".red().bold(), e);
            return ExitCode::from(EXIT_STARTUP);
        }
    };

    let outcome = runtime.block_on(async {
        match cli.command {
            Commands::Run(command) => run::execute(command, config).await,
            Commands::Admin(command) => admin::execute(command, config).await,
        }
    });

    match outcome {
        Ok(run::Completion::Finished) => {
            println!("{}", "done".green().bold());
            ExitCode::SUCCESS
        }
        Ok(run::Completion::Interrupted) => {
            println!("{}", "interrupted; shut down cleanly".yellow());
            ExitCode::from(EXIT_INTERRUPTED)
        }
        Err(e) => {
            // Single-line diagnostic, then the matching exit code.
            eprintln!("{} {}", "error:".red().bold(), e.to_diagnostic());
            match e.kind {
                aegis_core::ErrorKind::Invalid => ExitCode::from(EXIT_CONFIG),
                _ => ExitCode::from(EXIT_STARTUP),
            }
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
