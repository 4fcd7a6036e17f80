#![allow(clippy::doc_markdown)]
//! `VecLock` CLI - drive the locking core from the command line.
//!
//! ```text
//! veclock stress --threads 8 --ops 10000 --resources 64 --write-percent 20
//! veclock cycle --threads 4 --policy detect
//! veclock config --check
//! ```

mod output;
mod workload;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use veclock_core::{DeadlockPolicy, LockCore, LockCoreConfig};

use output::OutputFormat;
use workload::StressOptions;

/// VecLock - per-resource locking and deadlock handling for vector stores
#[derive(Parser, Debug)]
#[command(name = "veclock")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// TOML configuration file (VECLOCK_* environment variables override it)
    #[arg(short, long, global = true, env = "VECLOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

/// Policy override accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum PolicyArg {
    Prevent,
    Detect,
    Off,
}

impl From<PolicyArg> for DeadlockPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Prevent => Self::Prevent,
            PolicyArg::Detect => Self::Detect,
            PolicyArg::Off => Self::Off,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a random mix of shared and exclusive acquisitions
    Stress {
        /// Worker threads
        #[arg(short, long, default_value = "4")]
        threads: usize,

        /// Operations per thread
        #[arg(long, default_value = "10000")]
        ops: u64,

        /// Distinct resource ids
        #[arg(short, long, default_value = "64")]
        resources: u64,

        /// Share of exclusive acquisitions, 0-100
        #[arg(short, long, default_value = "20", value_parser = clap::value_parser!(u32).range(0..=100))]
        write_percent: u32,

        /// Microseconds each granted lock is held
        #[arg(long, default_value = "0")]
        hold_us: u64,

        /// Seed of the workload generator
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Deadlock policy override
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
    },

    /// Form a lock rotation across threads and show how it is resolved
    Cycle {
        /// Threads in the rotation
        #[arg(short, long, default_value = "4")]
        threads: usize,

        /// Deadlock policy override
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,

        /// Seconds to wait for the rotation to finish
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
    },

    /// Print the effective configuration as TOML
    Config {
        /// Only validate, print nothing on success
        #[arg(long)]
        check: bool,
    },
}

fn load_config(path: Option<&Path>, policy: Option<PolicyArg>) -> anyhow::Result<LockCoreConfig> {
    let mut config = LockCoreConfig::load(path)
        .with_context(|| match path {
            Some(p) => format!("loading configuration from {}", p.display()),
            None => "loading configuration".to_string(),
        })?;
    if let Some(policy) = policy {
        config.deadlock.policy = policy.into();
    }
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warn,veclock_core=info,veclock_cli=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Stress {
            threads,
            ops,
            resources,
            write_percent,
            hold_us,
            seed,
            policy,
        } => {
            let config = load_config(cli.config.as_deref(), policy)?;
            let core = Arc::new(LockCore::new(config)?);
            let options = StressOptions {
                threads: threads.max(1),
                ops_per_thread: ops,
                resources,
                write_percent,
                hold: Duration::from_micros(hold_us),
                seed,
            };
            let report = workload::run_stress(&core, &options)?;
            output::print_stress(&report, cli.format)?;
        }
        Command::Cycle {
            threads,
            policy,
            timeout_secs,
        } => {
            let config = load_config(cli.config.as_deref(), policy)?;
            let core = Arc::new(LockCore::new(config)?);
            let report = workload::run_cycle(&core, threads, Duration::from_secs(timeout_secs))?;
            output::print_cycle(&report, cli.format)?;
        }
        Command::Config { check } => {
            let config = load_config(cli.config.as_deref(), None)?;
            if check {
                eprintln!("{} configuration is valid", "ok:".green().bold());
            } else if cli.format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print!("{}", config.to_toml_string()?);
            }
        }
    }

    Ok(())
}
