//! Command-line definition

use clap::{Parser, Subcommand};
use schemagate::migration::DEFAULT_MESSAGE;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "schemagate-migrate")]
#[command(about = "Generate and apply schema migrations, and gate service readiness on them")]
#[command(version)]
pub struct Cli {
    /// Database connection URL (overrides DATABASE_URL and the config file)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Migrations directory path
    #[arg(long, global = true)]
    pub migrations_dir: Option<PathBuf>,

    /// Declared schema model used by `generate`
    #[arg(long, global = true)]
    pub schema_file: Option<PathBuf>,

    /// Configuration file (default: config/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Generate a new migration script from schema drift
    Generate {
        /// Apply pending migrations afterwards
        #[arg(long)]
        apply: bool,

        /// Write a template instead of diffing the live schema
        #[arg(long)]
        empty: bool,

        /// Migration message (words are joined with spaces)
        message: Vec<String>,
    },

    /// Apply pending migrations
    Apply {
        /// `head` or a script version
        #[arg(default_value = "head")]
        target: String,

        /// Show what would be applied without running anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Revert applied migrations down to a target
    Downgrade {
        /// `base` or a script version (which stays applied)
        target: String,
    },

    /// Show applied and pending migrations
    Status,

    /// Exit 0 when the database is at the chain tip, 1 otherwise
    Check {
        /// Keep polling for up to this many seconds
        #[arg(long, value_name = "SECONDS")]
        wait: Option<u64>,
    },

    /// Serve readiness and liveness probes over HTTP
    Probe,
}

impl Commands {
    /// Joined `generate` message, or the default
    pub fn message(words: &[String]) -> String {
        let joined = words.join(" ");
        if joined.trim().is_empty() {
            DEFAULT_MESSAGE.to_string()
        } else {
            joined
        }
    }
}
