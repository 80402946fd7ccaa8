use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use dwell_core::{Clock, SystemClock};
use tracing_subscriber::EnvFilter;

use dwell_cli::commands::{cleanup, recover, report, run, status};
use dwell_cli::{Cli, Commands, Config};

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(dwell_db::Database, Config)> {
    let config = load_config(config_path)?;
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = dwell_db::Database::open(&config.database_path).context("failed to open database")?;
    Ok((db, config))
}

fn load_config(config_path: Option<&Path>) -> Result<Config> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // stdout carries host messages during `run`, so logs go to stderr
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut stdout = std::io::stdout().lock();
    match &cli.command {
        Some(Commands::Run { ephemeral }) => {
            let config = load_config(cli.config.as_deref())?;
            drop(stdout);
            let runtime = tokio::runtime::Runtime::new().context("failed to initialize tokio runtime")?;
            runtime.block_on(run::run(&config, *ephemeral))?;
        }
        Some(Commands::Status { json }) => {
            let (db, config) = open_database(cli.config.as_deref())?;
            status::run(&mut stdout, &db, &config.database_path, *json)?;
        }
        Some(Commands::Recover { json }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            let _lock = run::acquire_lock(&config.lock_path())?;
            recover::run(&mut stdout, &mut db, &config.engine, Utc::now(), *json)?;
        }
        Some(Commands::Report { day, days, json }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            let clock = SystemClock;
            let end = day.unwrap_or_else(|| clock.timezone().day_of(clock.now()));
            report::run(&mut stdout, &db, end, *days, *json)?;
        }
        Some(Commands::Cleanup { days }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            let clock = SystemClock;
            let today = clock.timezone().day_of(clock.now());
            cleanup::run(
                &mut stdout,
                &mut db,
                days.unwrap_or(config.engine.retention_days),
                today,
            )?;
        }
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
