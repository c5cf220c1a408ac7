mod confirm;
mod logging;
mod report;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use strata_common::Error;
use strata_config::{ConfigLoader, RetryConfig, StrataConfig};
use strata_db::{
    Database, Executor, HistoryStore, Registry, Retry, RetryPolicy, RollbackManager,
    RollbackTarget, RunOptions, StatusReporter, create_migration, verify_database,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "strata", version, about = "Ordered, checksummed schema migrations")]
struct Cli {
    /// Config file (default: strata.yml, strata.yaml or strata.toml in the working directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database connection string; overrides config and environment
    #[arg(long, global = true)]
    database_url: Option<String>,

    /// Directory holding `<version>_<name>.<ext>` scripts
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations in version order
    Run {
        /// Show what would run without touching the database
        #[arg(short, long)]
        dry_run: bool,
        /// Re-apply versions that already succeeded
        #[arg(short, long)]
        force: bool,
        /// Highest version to apply (inclusive)
        #[arg(long)]
        target: Option<String>,
    },
    /// Mark applied migrations as rolled back (history only, the schema is not changed)
    Rollback {
        /// Number of most recent migrations to roll back (default 1)
        #[arg(long)]
        steps: Option<usize>,
        /// Roll back every migration newer than this version
        #[arg(long = "to")]
        to_version: Option<String>,
        /// Skip the confirmation prompt
        #[arg(short = 'y', long)]
        yes: bool,
    },
    /// Show applied, pending and drifted migrations
    Status {
        /// Print machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Compare applied checksums against the scripts on disk
    Verify {
        /// Exit non-zero when drift is found
        #[arg(long)]
        strict: bool,
    },
    /// Create an empty migration file with the next version
    New {
        /// Human-readable name, turned into the file-name slug
        name: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet; report directly.
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.log) {
        eprintln!("warning: {e:#}");
    }

    match execute(cli.command, &config) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

fn load_config(cli: &Cli) -> Result<StrataConfig> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load().context("failed to load configuration")?;

    if let Some(url) = &cli.database_url {
        config.database_url = Some(url.clone());
    }
    if let Some(dir) = &cli.migrations_dir {
        config.migrations_dir = dir.clone();
    }
    Ok(config)
}

/// Returns `false` when the command finished but the process should still exit non-zero.
fn execute(command: Commands, config: &StrataConfig) -> Result<bool> {
    let registry = Registry::new(&config.migrations_dir, config.extension.as_str());

    match command {
        Commands::Run {
            dry_run,
            force,
            target,
        } => {
            let history = HistoryStore::new(config.history_table.as_str())?;
            let db = connect(config, dry_run)?;
            let options = RunOptions {
                dry_run,
                force,
                target_version: target,
            };
            let run = Executor::new(&db, &registry, &history).run(&options)?;
            report::print_run(&run);
        }
        Commands::Rollback {
            steps,
            to_version,
            yes,
        } => {
            let target = RollbackTarget::from_flags(steps, to_version)?;
            let history = HistoryStore::new(config.history_table.as_str())?;
            let db = connect(config, false)?;
            let rollback = RollbackManager::new(&db, &registry, &history).rollback(
                &target,
                |selected| {
                    report::print_rollback_plan(selected);
                    yes || confirm::confirm_rollback(selected.len())
                },
            )?;
            report::print_rollback(&rollback);
        }
        Commands::Status { json } => {
            let history = HistoryStore::new(config.history_table.as_str())?;
            let db = connect(config, true)?;
            let status = StatusReporter::new(&db, &registry, &history).report()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                report::print_status(&status);
            }
        }
        Commands::Verify { strict } => {
            let history = HistoryStore::new(config.history_table.as_str())?;
            let db = connect(config, true)?;
            let drift = verify_database(&db, &registry, &history)?;
            report::print_drift(&drift);
            if strict && !drift.is_empty() {
                return Ok(false);
            }
        }
        Commands::New { name } => {
            let path = create_migration(&registry, &name)?;
            println!("Created {}", path.display());
        }
    }

    Ok(true)
}

/// Read-only commands never create the database file or write to it.
fn connect(config: &StrataConfig, read_only: bool) -> Result<Database> {
    let url = config.database_url()?;
    let retry = Retry::new(retry_policy(&config.retry));
    let db = if read_only {
        Database::connect_read_only(url, retry)?
    } else {
        Database::connect(url, retry)?
    };
    info!("connected to database");
    Ok(db)
}

fn retry_policy(config: &RetryConfig) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.max_attempts,
        initial_delay: Duration::from_millis(config.initial_delay_ms),
        multiplier: config.multiplier,
        max_delay: Duration::from_millis(config.max_delay_ms),
        jitter: config.jitter,
    }
}

fn report_error(err: &anyhow::Error) {
    eprintln!("error: {err:#}");

    if let Some(Error::Execution { version, applied, .. }) = err.downcast_ref::<Error>() {
        if applied.is_empty() {
            eprintln!("no migrations were applied before {version} failed");
        } else {
            eprintln!(
                "applied before {version} failed (still committed): {}",
                applied.join(", ")
            );
        }
    }
}
