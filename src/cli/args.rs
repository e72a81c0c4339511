//! CLI argument definitions using clap
//!
//! Commands:
//! - fedsync validate --config <path>
//! - fedsync loopback [--entities <n>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// fedsync - site-to-site state federation over a message bus
#[derive(Parser, Debug)]
#[command(name = "fedsync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log every federation event, not only warnings and errors
    #[arg(long, short, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Load and validate a federation configuration file
    Validate {
        /// Path to configuration file
        #[arg(long, default_value = "./fedsync.json")]
        config: PathBuf,
    },

    /// Run two in-process sites, mirror a subtree between them and print the counters
    Loopback {
        /// Number of entities changed after the full sync
        #[arg(long, default_value_t = 16)]
        entities: usize,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_validate() {
        let cli = Cli::try_parse_from(["fedsync", "validate", "--config", "/etc/fed.json"]).unwrap();
        assert!(!cli.verbose);
        match cli.command {
            Command::Validate { config } => assert_eq!(config, PathBuf::from("/etc/fed.json")),
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_parse_loopback_defaults() {
        let cli = Cli::try_parse_from(["fedsync", "loopback", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Loopback { entities: 16 }));
    }
}
