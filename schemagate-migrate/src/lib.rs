//! schemagate-migrate library
//!
//! Argument parsing and command handlers; `main.rs` only sets up logging and exit codes.

pub mod cli;
pub mod commands;
