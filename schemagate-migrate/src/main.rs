//! schemagate-migrate CLI
//!
//! Generates migration scripts from schema drift, applies and reverts them, and
//! gates service startup on the database being at the chain tip.

use clap::Parser;
use schemagate_migrate::cli::Cli;
use schemagate_migrate::commands;
use std::process;

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match commands::run(&cli) {
        Ok(()) => process::exit(0),
        Err(e) => {
            eprintln!("❌ Error: {e:#}");
            process::exit(1);
        }
    }
}
