//! Migration-specific error types

use crate::connection::ConnectionError;
use crate::executor::DbError;
use thiserror::Error;

fn describe_head(head: Option<i64>) -> String {
    head.map_or_else(|| "base".to_string(), |v| v.to_string())
}

fn join_versions(versions: &[i64]) -> String {
    versions
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Migration-specific errors
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database execution error outside of a migration script
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Could not open a connection to the history store
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Filesystem error while reading or writing scripts
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid migration file name or content
    #[error("Invalid migration format: {0}")]
    InvalidFormat(String),

    /// Declared schema model is malformed
    #[error("Invalid schema model: {0}")]
    InvalidSchemaModel(String),

    /// The live schema could not be introspected
    #[error("Schema diff unavailable: {0}")]
    DiffUnavailable(String),

    /// Auto-detection found no drift; nothing was written
    #[error("No schema changes detected")]
    NoChangesDetected,

    /// The database head is behind the chain tip, so a diff would repeat pending scripts
    #[error(
        "Target database is not up to date (head: {head}, tip: {tip}). \
         Apply pending migrations before generating a new one",
        head = describe_head(*.head),
        tip = describe_head(*.tip)
    )]
    DatabaseNotUpToDate { head: Option<i64>, tip: Option<i64> },

    /// Requested target is not a script in the repository
    #[error("Unknown migration target '{0}'")]
    UnknownTarget(String),

    /// The applied head does not exist in the repository
    #[error(
        "Applied head {0} is not present in the migration repository. \
         The database may have been migrated by a newer release"
    )]
    UnknownHead(i64),

    /// Another process holds the migration lock
    #[error(
        "Another migration run is in progress ({0}). Retry once it has finished"
    )]
    ConcurrentApplyInProgress(String),

    /// A script transformation failed; the head stays at the last success
    #[error("Migration '{name}' (version {version}) failed during execution: {error}")]
    ExecutionFailed {
        version: i64,
        name: String,
        error: String,
    },

    /// Two scripts share a predecessor, or there are several roots
    #[error(
        "Ambiguous migration chain: scripts {claimants} all follow {predecessor}. \
         Branching histories are not supported",
        claimants = join_versions(.claimants),
        predecessor = describe_head(*.predecessor)
    )]
    AmbiguousChain {
        predecessor: Option<i64>,
        claimants: Vec<i64>,
    },

    /// The chain has no root, a dangling predecessor or a cycle
    #[error("Broken migration chain: {0}")]
    BrokenChain(String),

    /// Two files carry the same version
    #[error("Duplicate migration version {0}")]
    DuplicateVersion(i64),

    /// A downgrade path crosses a script with no downgrade section
    #[error("Migration '{name}' (version {version}) has no downgrade and cannot be reverted")]
    IrreversibleMigration { version: i64, name: String },
}

impl MigrationError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        MigrationError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// `true` for outcomes callers may treat as success-with-no-op
    pub fn is_no_op(&self) -> bool {
        matches!(self, MigrationError::NoChangesDetected)
    }

    /// Version of the script the error is about, if any
    pub fn version(&self) -> Option<i64> {
        match self {
            MigrationError::ExecutionFailed { version, .. }
            | MigrationError::IrreversibleMigration { version, .. }
            | MigrationError::DuplicateVersion(version)
            | MigrationError::UnknownHead(version) => Some(*version),
            _ => None,
        }
    }
}
