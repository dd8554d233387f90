//! Migrator - generates, applies and reverts migration scripts

use crate::migration::lock::MigrationLockGuard;
use crate::migration::script::next_version;
use crate::migration::{
    AppliedRecord, ChecksumMismatch, DiffEngine, Direction, DowngradeTarget, HistoryReader,
    HistoryStore, MigrationError, MigrationScript, MigrationStatus, ScriptRepository,
    ScriptSummary, Target,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, Instant};

/// Upgrade body of a script generated with [`GenerateMode::Empty`]
pub const EMPTY_UPGRADE: &str = "-- write upgrade statements here";

/// Downgrade body of a script generated with [`GenerateMode::Empty`]
pub const EMPTY_DOWNGRADE: &str = "-- write downgrade statements here";

/// How `generate` fills the new script
pub enum GenerateMode<'a> {
    /// Template with placeholder sections, no database access
    Empty,
    /// Diff the live schema; requires the database to be at the chain tip
    AutoDetect {
        engine: &'a dyn DiffEngine,
        reader: &'a dyn HistoryReader,
    },
}

/// Result of `apply` / `downgrade`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Applied record after the run
    pub record: AppliedRecord,
    /// Versions whose transformation ran, in execution order
    pub applied: Vec<i64>,
}

impl ApplyOutcome {
    /// `true` when nothing had to run
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Core migration engine
///
/// The `Migrator` owns the script repository and drives a [`HistoryStore`].
/// It is used by the CLI and can be embedded in-process.
pub struct Migrator {
    repository: ScriptRepository,
    lock_timeout: Duration,
}

impl Migrator {
    /// Create a new Migrator over the scripts in `migrations_dir`
    pub fn new(migrations_dir: impl AsRef<Path>) -> Self {
        Self {
            repository: ScriptRepository::new(migrations_dir),
            lock_timeout: Duration::ZERO,
        }
    }

    /// Wait up to `timeout` for a concurrent run to release the lock (default: fail fast)
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn repository(&self) -> &ScriptRepository {
        &self.repository
    }

    /// Generate a new script that follows the current chain tip
    ///
    /// A blank `message` becomes `"auto migration"`.
    ///
    /// # Errors
    ///
    /// - `AmbiguousChain` / `BrokenChain` / `DuplicateVersion` if the repository is invalid
    /// - `DiffUnavailable` if the applied head or the live schema cannot be read
    /// - `DatabaseNotUpToDate` if the database head is not the chain tip
    /// - `NoChangesDetected` if auto-detection found nothing; no file is written
    /// - `Io` if the script cannot be written
    pub fn generate(
        &self,
        message: &str,
        mode: GenerateMode<'_>,
    ) -> Result<MigrationScript, MigrationError> {
        let chain = self.repository.chain()?;
        let tip = chain.tip_version();

        let (upgrade, downgrade) = match mode {
            GenerateMode::Empty => (EMPTY_UPGRADE.to_string(), EMPTY_DOWNGRADE.to_string()),
            GenerateMode::AutoDetect { engine, reader } => {
                let record = reader.applied_record().map_err(|e| {
                    MigrationError::DiffUnavailable(format!("cannot read the applied head: {e}"))
                })?;
                if record.head != tip {
                    return Err(MigrationError::DatabaseNotUpToDate {
                        head: record.head,
                        tip,
                    });
                }

                let diff = engine.diff()?;
                if diff.is_empty() {
                    log::info!("no schema changes detected; nothing generated");
                    return Err(MigrationError::NoChangesDetected);
                }
                log::info!("detected {} schema change(s)", diff.upgrade.len());
                (diff.upgrade_sql(), diff.downgrade_sql())
            }
        };

        let now = Utc::now();
        let script = MigrationScript::new(
            next_version(now, tip),
            message,
            tip,
            upgrade,
            Some(downgrade),
            now,
        );
        self.repository.write(&script)
    }

    /// Apply pending scripts up to `target`
    ///
    /// The chain and the target are validated before the lock is taken. Each script
    /// runs in its own transaction and moves the head on success; on failure the run
    /// stops with the head at the last successful script, and re-running resumes there.
    ///
    /// # Errors
    ///
    /// - chain validation errors and `UnknownTarget`, before any side effect
    /// - `ConcurrentApplyInProgress` if another run holds the lock
    /// - `UnknownHead` if the database head is not in the repository
    /// - `ExecutionFailed` for the first failing script
    pub fn apply(
        &self,
        store: &dyn HistoryStore,
        target: &Target,
    ) -> Result<ApplyOutcome, MigrationError> {
        let chain = self.repository.chain()?;
        chain.validate_target(target)?;

        let _lock = MigrationLockGuard::acquire(store, self.lock_timeout)?;
        store.initialize()?;

        let record = store.applied_record()?;
        let pending = chain.pending(record.head, target)?;

        if pending.is_empty() {
            log::info!("database is up to date at {record}");
            return Ok(ApplyOutcome {
                record,
                applied: Vec::new(),
            });
        }

        log::info!(
            "applying {} migration(s) from {record} to {target}",
            pending.len()
        );

        let mut head = record.head;
        let mut applied = Vec::with_capacity(pending.len());
        for script in pending {
            run_script(store, script, Direction::Up, Some(script.version))?;
            head = Some(script.version);
            applied.push(script.version);
        }

        Ok(ApplyOutcome {
            record: AppliedRecord::new(head),
            applied,
        })
    }

    /// Revert applied scripts, newest first, down to `target` (exclusive)
    ///
    /// Every script on the path must be reversible; this is checked before anything runs.
    ///
    /// # Errors
    ///
    /// - chain validation errors and `UnknownTarget`, before any side effect
    /// - `ConcurrentApplyInProgress` if another run holds the lock
    /// - `IrreversibleMigration` if a script on the path has no downgrade
    /// - `ExecutionFailed` for the first failing downgrade
    pub fn downgrade(
        &self,
        store: &dyn HistoryStore,
        target: &DowngradeTarget,
    ) -> Result<ApplyOutcome, MigrationError> {
        let chain = self.repository.chain()?;
        if let DowngradeTarget::Version(v) = target {
            if !chain.contains(*v) {
                return Err(MigrationError::UnknownTarget(v.to_string()));
            }
        }

        let _lock = MigrationLockGuard::acquire(store, self.lock_timeout)?;
        store.initialize()?;

        let record = store.applied_record()?;
        let path = chain.rollback_path(record.head, target)?;

        if let Some(script) = path.iter().find(|s| !s.is_reversible()) {
            return Err(MigrationError::IrreversibleMigration {
                version: script.version,
                name: script.name(),
            });
        }

        if path.is_empty() {
            log::info!("nothing to downgrade; database is at {record}");
            return Ok(ApplyOutcome {
                record,
                applied: Vec::new(),
            });
        }

        log::info!(
            "reverting {} migration(s) from {record} to {target}",
            path.len()
        );

        let mut head = record.head;
        let mut reverted = Vec::with_capacity(path.len());
        for script in path {
            run_script(store, script, Direction::Down, script.predecessor)?;
            head = script.predecessor;
            reverted.push(script.version);
        }

        Ok(ApplyOutcome {
            record: AppliedRecord::new(head),
            applied: reverted,
        })
    }

    /// Applied and pending scripts, plus files edited after they ran
    ///
    /// Read-only: takes no lock and creates no tables.
    ///
    /// # Errors
    ///
    /// Returns chain validation errors, `UnknownHead`, or the store's read errors.
    pub fn status(&self, store: &dyn HistoryStore) -> Result<MigrationStatus, MigrationError> {
        let chain = self.repository.chain()?;
        let record = store.applied_record()?;
        let pending = chain.pending(record.head, &Target::Head)?;

        let applied_count = chain.len() - pending.len();
        let applied: Vec<ScriptSummary> = chain
            .iter()
            .take(applied_count)
            .map(ScriptSummary::from)
            .collect();

        // last upgrade checksum per version
        let mut recorded: HashMap<i64, String> = HashMap::new();
        for entry in store.history()? {
            if entry.direction == Direction::Up {
                recorded.insert(entry.version, entry.checksum);
            }
        }

        let mut mismatches = Vec::new();
        for summary in &applied {
            if let Some(checksum) = recorded.get(&summary.version) {
                if *checksum != summary.checksum {
                    log::warn!(
                        "migration {} ({}) was modified after it was applied",
                        summary.version,
                        summary.name
                    );
                    mismatches.push(ChecksumMismatch {
                        version: summary.version,
                        name: summary.name.clone(),
                        recorded: checksum.clone(),
                        current: summary.checksum.clone(),
                    });
                }
            }
        }

        Ok(MigrationStatus::new(
            record.head,
            chain.tip_version(),
            applied,
            pending.into_iter().map(ScriptSummary::from).collect(),
            mismatches,
        ))
    }
}

fn run_script(
    store: &dyn HistoryStore,
    script: &MigrationScript,
    direction: Direction,
    new_head: Option<i64>,
) -> Result<(), MigrationError> {
    let start = Instant::now();
    log::info!(
        "{} {} ({})",
        if direction == Direction::Up { "applying" } else { "reverting" },
        script.version,
        script.message
    );

    match store.apply_script(script, direction, new_head) {
        Ok(entry) => {
            #[cfg(feature = "metrics")]
            crate::metrics::record_applied(start.elapsed());
            log::info!(
                "{} {direction} finished in {}ms",
                script.version,
                entry.execution_time_ms.max(0)
            );
            Ok(())
        }
        Err(e) => {
            #[cfg(feature = "metrics")]
            crate::metrics::record_failed();
            log::error!(
                "migration {} failed after {:?}: {e}",
                script.version,
                start.elapsed()
            );
            Err(MigrationError::ExecutionFailed {
                version: script.version,
                name: script.name(),
                error: e.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{LiveSchema, LiveTable, MemoryHistoryStore, ModelDiffEngine, SchemaModel};

    const MODEL: &str = r#"
[[tables]]
name = "users"

[[tables.columns]]
name = "id"
type = "uuid"
primary_key = true

[[tables.columns]]
name = "email"
type = "VARCHAR(255)"
"#;

    fn model() -> SchemaModel {
        SchemaModel::from_toml_str(MODEL).expect("model")
    }

    #[test]
    fn test_generate_empty_template() {
        let dir = tempfile::tempdir().expect("tempdir");
        let migrator = Migrator::new(dir.path());

        let first = migrator.generate("", GenerateMode::Empty).expect("first");
        assert_eq!(first.message, "auto migration");
        assert_eq!(first.predecessor, None);
        assert!(first.path.as_ref().is_some_and(|p| p.exists()));

        let second = migrator.generate("second", GenerateMode::Empty).expect("second");
        assert_eq!(second.predecessor, Some(first.version));
        assert!(second.version > first.version);

        let chain = migrator.repository().chain().expect("chain");
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.tip_version(), Some(second.version));
    }

    #[test]
    fn test_autodetect_writes_diff() {
        let dir = tempfile::tempdir().expect("tempdir");
        let migrator = Migrator::new(dir.path());
        let store = MemoryHistoryStore::new();
        let engine = ModelDiffEngine::new(model(), LiveSchema::new());

        let script = migrator
            .generate(
                "create users",
                GenerateMode::AutoDetect {
                    engine: &engine,
                    reader: &store,
                },
            )
            .expect("generate");
        assert!(script.upgrade.starts_with(r#"CREATE TABLE "users""#));
        assert_eq!(script.downgrade.as_deref(), Some(r#"DROP TABLE "users";"#));
    }

    #[test]
    fn test_autodetect_without_changes_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let migrator = Migrator::new(dir.path().join("migrations"));
        let store = MemoryHistoryStore::new();
        let live = LiveSchema::new().with_table(
            "users",
            LiveTable::default()
                .with_column("id", "uuid", false)
                .with_column("email", "character varying(255)", false),
        );
        let engine = ModelDiffEngine::new(model(), live);

        let err = migrator
            .generate(
                "noop",
                GenerateMode::AutoDetect {
                    engine: &engine,
                    reader: &store,
                },
            )
            .expect_err("no changes");
        assert!(err.is_no_op());
        assert!(migrator.repository().load().expect("load").is_empty());
    }

    #[test]
    fn test_autodetect_requires_up_to_date_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let migrator = Migrator::new(dir.path());
        let first = migrator.generate("first", GenerateMode::Empty).expect("first");

        let store = MemoryHistoryStore::new();
        let engine = ModelDiffEngine::new(model(), LiveSchema::new());
        let err = migrator
            .generate(
                "second",
                GenerateMode::AutoDetect {
                    engine: &engine,
                    reader: &store,
                },
            )
            .expect_err("stale");
        match err {
            MigrationError::DatabaseNotUpToDate { head, tip } => {
                assert_eq!(head, None);
                assert_eq!(tip, Some(first.version));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_autodetect_unreachable_store_is_diff_unavailable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let migrator = Migrator::new(dir.path());
        let store = MemoryHistoryStore::new();
        store.set_unreachable(true);
        let engine = ModelDiffEngine::new(model(), LiveSchema::new());

        let err = migrator
            .generate(
                "x",
                GenerateMode::AutoDetect {
                    engine: &engine,
                    reader: &store,
                },
            )
            .expect_err("unavailable");
        assert!(matches!(err, MigrationError::DiffUnavailable(_)));
    }

    #[test]
    fn test_apply_then_status() {
        let dir = tempfile::tempdir().expect("tempdir");
        let migrator = Migrator::new(dir.path());
        let a = migrator.generate("a", GenerateMode::Empty).expect("a");
        let b = migrator.generate("b", GenerateMode::Empty).expect("b");

        let store = MemoryHistoryStore::new();
        let outcome = migrator.apply(&store, &Target::Head).expect("apply");
        assert_eq!(outcome.applied, vec![a.version, b.version]);
        assert_eq!(outcome.record.head, Some(b.version));
        assert!(store.is_initialized());
        assert!(store.lock_owner().is_none());

        let status = migrator.status(&store).expect("status");
        assert!(status.is_up_to_date());
        assert_eq!(status.applied_count, 2);
        assert!(status.checksum_mismatches.is_empty());
    }

    #[test]
    fn test_downgrade_to_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        let migrator = Migrator::new(dir.path());
        let a = migrator.generate("a", GenerateMode::Empty).expect("a");
        let b = migrator.generate("b", GenerateMode::Empty).expect("b");

        let store = MemoryHistoryStore::new();
        migrator.apply(&store, &Target::Head).expect("apply");

        let outcome = migrator
            .downgrade(&store, &DowngradeTarget::Version(a.version))
            .expect("downgrade");
        assert_eq!(outcome.applied, vec![b.version]);
        assert_eq!(store.head(), Some(a.version));

        let outcome = migrator.downgrade(&store, &DowngradeTarget::Base).expect("base");
        assert_eq!(outcome.record.head, None);
        assert!(migrator.downgrade(&store, &DowngradeTarget::Base).expect("noop").is_noop());
    }
}
