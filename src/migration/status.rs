//! Migration status reporting

use crate::migration::MigrationScript;
use std::path::PathBuf;

/// One script as shown by `status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSummary {
    pub version: i64,

    /// Slug used in the file name and the history log
    pub name: String,

    pub message: String,

    pub path: Option<PathBuf>,

    pub checksum: String,

    /// Whether the script has a downgrade section
    pub reversible: bool,
}

impl From<&MigrationScript> for ScriptSummary {
    fn from(script: &MigrationScript) -> Self {
        Self {
            version: script.version,
            name: script.name(),
            message: script.message.clone(),
            path: script.path.clone(),
            checksum: script.checksum.clone(),
            reversible: script.is_reversible(),
        }
    }
}

/// An applied script whose file changed after it ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumMismatch {
    pub version: i64,
    pub name: String,
    /// Checksum recorded in the history log
    pub recorded: String,
    /// Checksum of the file on disk
    pub current: String,
}

/// Migration status information
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Applied head (`None` = base)
    pub head: Option<i64>,

    /// Newest script in the repository
    pub tip: Option<i64>,

    /// Scripts up to and including the head, in chain order
    pub applied: Vec<ScriptSummary>,

    /// Scripts after the head, in chain order
    pub pending: Vec<ScriptSummary>,

    /// Applied scripts edited since they ran
    pub checksum_mismatches: Vec<ChecksumMismatch>,

    /// Total number of scripts (applied + pending)
    pub total: usize,

    pub applied_count: usize,

    pub pending_count: usize,
}

impl MigrationStatus {
    /// Create a new `MigrationStatus`
    #[must_use]
    pub fn new(
        head: Option<i64>,
        tip: Option<i64>,
        applied: Vec<ScriptSummary>,
        pending: Vec<ScriptSummary>,
        checksum_mismatches: Vec<ChecksumMismatch>,
    ) -> Self {
        let applied_count = applied.len();
        let pending_count = pending.len();

        Self {
            head,
            tip,
            applied,
            pending,
            checksum_mismatches,
            total: applied_count + pending_count,
            applied_count,
            pending_count,
        }
    }

    /// Check if all scripts are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending_count == 0
    }

    /// Get the next pending script version
    #[must_use]
    pub fn next_pending_version(&self) -> Option<i64> {
        self.pending.first().map(|m| m.version)
    }
}
