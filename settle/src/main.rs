//! Settle - command line front end.
//!
//! Runs one checker action against a config file and prints its output map
//! as JSON. Exit status: 0 when the action succeeded, 1 when it completed
//! without its condition holding, 2 on any error.

#![forbid(unsafe_code)]

mod config_file;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use settle_common::wait::{self, ReadyError};
use settle_common::{ActionRegistry, LogFormat, OutputData, Settings, init_logging};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "settle")]
#[command(author, version, about = "Wait for eventually consistent systems to converge")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format on stderr (pretty or json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an action with a JSON, YAML or TOML config
    Run {
        /// Registered action name (see `settle actions`)
        action: String,

        /// Config file, or `-` for JSON on stdin
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Wait until an HTTP endpoint answers 200
    WaitHttp {
        url: String,

        #[arg(short, long, default_value = "60s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// Wait until a TCP port accepts connections
    WaitTcp {
        host: String,
        port: u16,

        #[arg(short, long, default_value = "60s", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// List registered actions
    Actions,
}

/// How a command finished when it did not error.
enum Outcome {
    Succeeded,
    Unsatisfied,
}

impl From<Outcome> for ExitCode {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Succeeded => ExitCode::SUCCESS,
            Outcome::Unsatisfied => ExitCode::from(1),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(outcome) => outcome.into(),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<Outcome> {
    let mut settings = Settings::from_env()?;
    if cli.verbose {
        settings.log.level = "debug".to_string();
    }
    if let Some(format) = cli.log_format {
        settings.log.format = format;
    }
    init_logging(&settings.log).context("Failed to initialize logging")?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Run { action, config } => {
            let config = config_file::load(&config)?;
            let registry = ActionRegistry::with_defaults(&settings);
            let output = registry.execute(&action, &cancel, &config).await?;
            print_output(&output)?;
            Ok(outcome_of(&output))
        }
        Commands::WaitHttp { url, timeout } => {
            ready(wait::wait_for_http_ready(&cancel, &url, timeout).await)
        }
        Commands::WaitTcp {
            host,
            port,
            timeout,
        } => ready(wait::wait_for_tcp_ready(&cancel, &host, port, timeout).await),
        Commands::Actions => {
            for name in ActionRegistry::with_defaults(&settings).names() {
                println!("{name}");
            }
            Ok(Outcome::Succeeded)
        }
    }
}

fn print_output(output: &OutputData) -> Result<()> {
    let rendered = serde_json::to_string_pretty(output).context("Failed to encode output")?;
    println!("{rendered}");
    Ok(())
}

/// Outputs without a `success` flag (e.g. `transform`) count as success.
fn outcome_of(output: &OutputData) -> Outcome {
    match output.get("success") {
        Some(Value::Bool(false)) => Outcome::Unsatisfied,
        _ => Outcome::Succeeded,
    }
}

fn ready(result: Result<(), ReadyError>) -> Result<Outcome> {
    match result {
        Ok(()) => {
            info!("Ready");
            Ok(Outcome::Succeeded)
        }
        Err(ReadyError::NotReady { target, reason }) => {
            eprintln!("{target} not ready: {reason}");
            Ok(Outcome::Unsatisfied)
        }
        Err(err) => Err(err.into()),
    }
}
