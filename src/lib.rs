//! # schemagate
//!
//! Migration orchestration and schema-gated startup for PostgreSQL services on the
//! `may` runtime: detect drift, generate a versioned script, apply it under a lock,
//! and report the service ready only once the database is at the chain tip.

pub mod config;
pub mod connection;
pub mod executor;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod migration;
pub mod probe;
pub mod readiness;
pub mod transaction;

pub use config::GateConfig;
pub use connection::{connect, ConnectionError};
pub use executor::{DbError, PgExecutor, SqlExecutor};
pub use migration::{MigrationError, Migrator};
pub use readiness::{NotReadyReason, Readiness, ReadinessGate};
