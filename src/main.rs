//! Identity merge CLI
//!
//! Maintenance entry point for data-migration tooling.
//!
//! ## Usage
//!
//! ```bash
//! # Create the schema in the configured database
//! identity-merge init
//!
//! # Merge a duplicate person into the surviving one
//! identity-merge merge --source <person-id> --target <person-id>
//!
//! # Row counts per table
//! identity-merge --database /data/certification.db stats
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use identity_merge::{db, CollisionPolicy, Config, MergeInput, PreferOldest, RetryPolicy, TargetWins};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "identity-merge")]
#[command(about = "Merge duplicate person records in a certification database")]
struct Args {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true, env = "IDENTITY_MERGE_DATABASE")]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create or upgrade the schema
    Init,

    /// Merge one person into another and print the report
    Merge {
        /// Person that disappears
        #[arg(long)]
        source: String,

        /// Person that survives
        #[arg(long)]
        target: String,

        /// Tie-break strategy for colliding records
        #[arg(long, value_enum, default_value_t = PolicyArg::TargetWins)]
        policy: PolicyArg,
    },

    /// Print row counts per table
    Stats,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PolicyArg {
    TargetWins,
    PreferOldest,
}

impl PolicyArg {
    fn policy(self) -> Box<dyn CollisionPolicy> {
        match self {
            PolicyArg::TargetWins => Box::new(TargetWins),
            PolicyArg::PreferOldest => Box::new(PreferOldest),
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("identity_merge=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(database) = args.database {
        config.database_path = database;
    }

    match args.command {
        Command::Init => {
            let pool = db::open_pool(&config)?;
            let mut conn = pool.get().context("Failed to get connection")?;
            let stats = db::stats(&mut conn)?;
            info!(path = %config.database_path.display(), persons = stats.persons, "Schema ready");
        }
        Command::Merge { source, target, policy } => {
            let policy = policy.policy();
            let mut conn = db::open(&config.database_path, config.busy_timeout())?;
            let report = identity_merge::merge_persons(
                &mut conn,
                &MergeInput::new(source, target),
                policy.as_ref(),
                &RetryPolicy::from(&config),
            )?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            let mut conn = db::open(&config.database_path, config.busy_timeout())?;
            let stats = db::stats(&mut conn)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
    }

    Ok(())
}
