//! CLI module for fedsync
//!
//! Provides command-line interface for:
//! - validate: Load and check a federation config file
//! - loopback: Run a two-site in-process federation and report counters

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{loopback, run, run_command, validate};
pub use errors::{CliError, CliErrorCode, CliResult};
