//! dwell CLI library.
//!
//! Argument parsing, configuration and the engine runtime behind the `dwell`
//! binary.

mod cli;
pub mod commands;
mod config;
pub mod runtime;

pub use cli::{Cli, Commands};
pub use config::{Config, dirs_data_path};
