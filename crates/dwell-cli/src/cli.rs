//! Command-line argument definitions.

use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};

/// Browser activity tracker.
///
/// Turns tab, focus and idle signals into per-site active-time sessions and
/// keeps the host application in sync.
#[derive(Debug, Parser)]
#[command(name = "dwell", version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the engine, reading JSON-lines signals and host messages on stdin.
    Run {
        /// Keep sessions in memory instead of the database.
        #[arg(long)]
        ephemeral: bool,
    },

    /// Show the open session and sync backlog.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Finalize or re-attach sessions left open by a previous run.
    Recover {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show active time per site and day.
    Report {
        /// Last day of the report (local date, defaults to today).
        #[arg(long)]
        day: Option<NaiveDate>,

        /// Number of days to include, ending at `--day`.
        #[arg(long, default_value_t = 1)]
        days: u32,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Delete completed sessions past the retention window.
    Cleanup {
        /// Retention in days, overriding `engine.retention_days`.
        #[arg(long)]
        days: Option<u32>,
    },
}
