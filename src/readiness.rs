//! Startup gate: is the database at the tip of the migration chain?
//!
//! The gate only reads. It never applies migrations, never takes the apply lock,
//! and can be polled concurrently from probe handlers.

use crate::migration::{HistoryReader, MigrationError, ScriptRepository, Target};
use serde_json::{json, Value};
use std::fmt;
use std::path::Path;
use std::time::{Duration, Instant};

/// Why the service must not receive traffic yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReadyReason {
    /// Scripts exist that the database has not applied
    PendingMigrations(usize),
    /// The applied head could not be read
    HistoryStoreUnreachable(String),
    /// The script repository does not form a valid chain
    ChainInvalid(String),
    /// The database was migrated past what this release knows about
    UnknownHead(i64),
}

impl NotReadyReason {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            NotReadyReason::PendingMigrations(_) => "pending_migrations",
            NotReadyReason::HistoryStoreUnreachable(_) => "history_store_unreachable",
            NotReadyReason::ChainInvalid(_) => "chain_invalid",
            NotReadyReason::UnknownHead(_) => "unknown_head",
        }
    }
}

impl fmt::Display for NotReadyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotReadyReason::PendingMigrations(n) => write!(f, "{n} pending migration(s)"),
            NotReadyReason::HistoryStoreUnreachable(e) => {
                write!(f, "migration history store unreachable: {e}")
            }
            NotReadyReason::ChainInvalid(e) => write!(f, "migration chain is invalid: {e}"),
            NotReadyReason::UnknownHead(v) => {
                write!(f, "database head {v} is not in the migration repository")
            }
        }
    }
}

/// Result of a readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(NotReadyReason),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    /// JSON body for probe responses
    ///
    /// `{"status":"ready"}` or e.g. `{"status":"not_ready","reason":"pending_migrations","pending":2}`
    pub fn to_json(&self) -> Value {
        match self {
            Readiness::Ready => json!({ "status": "ready" }),
            Readiness::NotReady(reason) => {
                let mut body = json!({
                    "status": "not_ready",
                    "reason": reason.code(),
                });
                match reason {
                    NotReadyReason::PendingMigrations(n) => body["pending"] = json!(n),
                    NotReadyReason::UnknownHead(v) => body["head"] = json!(v),
                    NotReadyReason::HistoryStoreUnreachable(detail)
                    | NotReadyReason::ChainInvalid(detail) => body["detail"] = json!(detail),
                }
                body
            }
        }
    }

    #[cfg(feature = "metrics")]
    fn record(&self) {
        match self {
            Readiness::Ready => crate::metrics::record_readiness("ready", Some(0)),
            Readiness::NotReady(NotReadyReason::PendingMigrations(n)) => {
                crate::metrics::record_readiness("pending_migrations", Some(*n));
            }
            Readiness::NotReady(reason) => crate::metrics::record_readiness(reason.code(), None),
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Ready => write!(f, "ready"),
            Readiness::NotReady(reason) => write!(f, "not ready: {reason}"),
        }
    }
}

/// Compares the applied head with the chain tip
pub struct ReadinessGate<R> {
    repository: ScriptRepository,
    reader: R,
}

impl<R: HistoryReader> ReadinessGate<R> {
    pub fn new(migrations_dir: impl AsRef<Path>, reader: R) -> Self {
        Self {
            repository: ScriptRepository::new(migrations_dir),
            reader,
        }
    }

    /// Check once; never fails and never panics
    pub fn check_ready(&self) -> Readiness {
        let readiness = self.evaluate();
        match &readiness {
            Readiness::Ready => log::debug!("readiness check: ready"),
            Readiness::NotReady(reason) => log::info!("readiness check: not ready ({reason})"),
        }
        #[cfg(feature = "metrics")]
        readiness.record();
        readiness
    }

    fn evaluate(&self) -> Readiness {
        let chain = match self.repository.chain() {
            Ok(chain) => chain,
            Err(e) => return Readiness::NotReady(NotReadyReason::ChainInvalid(e.to_string())),
        };

        let record = match self.reader.applied_record() {
            Ok(record) => record,
            Err(e) => {
                log::warn!("cannot read applied migration head: {e}");
                return Readiness::NotReady(NotReadyReason::HistoryStoreUnreachable(
                    e.to_string(),
                ));
            }
        };

        match chain.pending(record.head, &Target::Head) {
            Ok(pending) if pending.is_empty() => Readiness::Ready,
            Ok(pending) => Readiness::NotReady(NotReadyReason::PendingMigrations(pending.len())),
            Err(MigrationError::UnknownHead(head)) => {
                Readiness::NotReady(NotReadyReason::UnknownHead(head))
            }
            Err(e) => Readiness::NotReady(NotReadyReason::ChainInvalid(e.to_string())),
        }
    }

    /// Poll every `poll_interval` until ready or `max_wait` has passed
    ///
    /// Returns the last observed state.
    pub fn wait_until_ready(&self, poll_interval: Duration, max_wait: Duration) -> Readiness {
        let start = Instant::now();
        loop {
            let readiness = self.check_ready();
            let elapsed = start.elapsed();
            if readiness.is_ready() || elapsed >= max_wait {
                return readiness;
            }
            std::thread::sleep(poll_interval.min(max_wait - elapsed));
        }
    }
}
