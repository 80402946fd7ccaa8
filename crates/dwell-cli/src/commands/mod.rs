//! CLI subcommand implementations.

pub mod cleanup;
pub mod recover;
pub mod report;
pub mod run;
pub mod status;
