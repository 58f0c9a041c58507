//! `iomiddle-stat`: configuration diagnostic tool (A6).
//!
//! Not itself hooked into anything; reads the same `IOMIDDLE_*` environment
//! the shim would, validates it, and prints the report a site administrator
//! runs before adding `iomiddle-shim` to a job script. Shape (clap derive +
//! `anyhow` + `tracing-subscriber` verbosity-to-filter mapping, `ExitCode`
//! from a `run()` that returns `anyhow::Result`) follows `oxcrypt-cli`'s
//! `main.rs`.

#![deny(unsafe_code)]

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use iomiddle_core::Config;
use tracing_subscriber::EnvFilter;

/// Diagnose `IOMIDDLE_*` environment configuration before adding the
/// middleware to a job script.
#[derive(Parser)]
#[command(name = "iomiddle-stat")]
#[command(author, version, about)]
#[command(after_help = "EXAMPLES:
    # Validate the environment this shell would hand to a 64-rank job
    IOMIDDLE_CARE_PATH=/scratch/out IOMIDDLE_FORWARDER=8 iomiddle-stat check --nprocs 64

    # Print the resolved configuration without validating nprocs
    IOMIDDLE_CARE_PATH=/scratch/out iomiddle-stat show
")]
struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate `IOMIDDLE_*`, exiting non-zero on misconfiguration.
    Check {
        /// Process count to validate IOMIDDLE_FORWARDER against (the job's nprocs).
        #[arg(long)]
        nprocs: Option<u32>,
    },
    /// Print the resolved configuration without validating against nprocs.
    Show,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    match run(&cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn setup_tracing(verbose: u8) {
    let filter = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(command: &Commands) -> Result<()> {
    let config = Config::from_env().context("failed to parse IOMIDDLE_* environment")?;
    tracing::debug!(care_path = %config.care_path, disabled = config.disabled, "parsed IOMIDDLE_* environment");
    if config.disabled {
        tracing::warn!("IOMIDDLE_DISABLE=1: the shim installs nothing and every operation passes through");
    }

    match command {
        Commands::Check { nprocs } => {
            if let Some(nprocs) = nprocs {
                config
                    .validate_against(*nprocs)
                    .context("IOMIDDLE_FORWARDER is inconsistent with --nprocs")?;
            }
            print_report(&config);
            tracing::info!(nprocs = ?nprocs, "configuration validated");
            println!("configuration OK");
            Ok(())
        }
        Commands::Show => {
            print_report(&config);
            Ok(())
        }
    }
}

fn print_report(config: &Config) {
    println!("care path:      {}", config.care_path);
    println!("disabled:       {}", config.disabled);
    println!(
        "forwarders:     {}",
        config
            .forwarders
            .map_or_else(|| "all-ranks mode".to_string(), |f| f.to_string())
    );
    println!("lanes:          {}", config.lanes);
    println!("worker enabled: {}", config.worker_enabled);
    println!("truncate:       {}", config.trunc_enabled);
    println!("stats:          {:?}", config.stats);
    println!("confirm banner: {}", config.confirm_banner);
}
