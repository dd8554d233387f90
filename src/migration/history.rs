//! Migration history store: applied head, audit log and the apply lock
//!
//! The PostgreSQL store keeps two tables:
//!
//! - `schemagate_version`: a single row (`id = 1`) holding the applied head
//! - `schemagate_history`: append-only log of every transformation that ran
//!
//! Mutual exclusion between concurrent `apply` runs uses a session-level advisory
//! lock, so a crashed process never leaves a stale lock behind.

use crate::connection::{connect, with_connect_timeout};
use crate::executor::{is_blank_sql, DbError, PgExecutor, SqlExecutor};
use crate::migration::{AppliedRecord, Direction, HistoryEntry, MigrationError, MigrationScript};
use crate::transaction::Transaction;
use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

/// Advisory lock key shared by every `schemagate` process ("SCHEMAGA" in ASCII)
pub const ADVISORY_LOCK_KEY: i64 = 0x5343_4845_4D41_4741;

/// Name of the single-row applied-state table
pub const VERSION_TABLE: &str = "schemagate_version";

/// Name of the history log table
pub const HISTORY_TABLE: &str = "schemagate_history";

/// Connect timeout of [`PgHistoryReader`]
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only access to the applied head
///
/// Implementations must not take locks or create tables: readers run from the
/// readiness probe, possibly against a database no `apply` has touched yet.
pub trait HistoryReader {
    /// Current applied record; a store that was never initialized reads as `head = None`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the store cannot be reached.
    fn applied_record(&self) -> Result<AppliedRecord, MigrationError>;
}

impl<R: HistoryReader + ?Sized> HistoryReader for std::sync::Arc<R> {
    fn applied_record(&self) -> Result<AppliedRecord, MigrationError> {
        (**self).applied_record()
    }
}

/// Full history store used by `apply` and `downgrade`
pub trait HistoryStore: HistoryReader {
    /// Create the bookkeeping tables if they do not exist
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the tables cannot be created.
    fn initialize(&self) -> Result<(), MigrationError>;

    /// Run one transformation of `script`, move the head to `new_head` and append a
    /// history entry, all in one transaction
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the transformation or the bookkeeping fails; the
    /// head is then unchanged.
    fn apply_script(
        &self,
        script: &MigrationScript,
        direction: Direction,
        new_head: Option<i64>,
    ) -> Result<HistoryEntry, MigrationError>;

    /// Try to take the apply lock without waiting
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the lock state cannot be queried.
    fn try_lock(&self, owner: &str) -> Result<bool, MigrationError>;

    /// Release the apply lock taken by `owner`
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the release cannot be sent.
    fn unlock(&self, owner: &str) -> Result<(), MigrationError>;

    /// Every history entry, oldest first
    ///
    /// # Errors
    ///
    /// Returns `MigrationError` if the log cannot be read.
    fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError>;
}

/// History store over any [`SqlExecutor`]
pub struct PostgresHistoryStore<'a> {
    executor: &'a dyn SqlExecutor,
}

impl<'a> PostgresHistoryStore<'a> {
    pub fn new(executor: &'a dyn SqlExecutor) -> Self {
        Self { executor }
    }

    fn table_exists(&self, table: &str) -> Result<bool, DbError> {
        let row = self
            .executor
            .query_one("SELECT to_regclass($1) IS NOT NULL", &[&table])?;
        Ok(row.try_get::<_, bool>(0)?)
    }
}

impl HistoryReader for PostgresHistoryStore<'_> {
    fn applied_record(&self) -> Result<AppliedRecord, MigrationError> {
        if !self.table_exists(VERSION_TABLE)? {
            return Ok(AppliedRecord::default());
        }

        let rows = self
            .executor
            .query_all("SELECT version FROM schemagate_version WHERE id = 1", &[])?;
        let head = match rows.first() {
            Some(row) => row.try_get::<_, Option<i64>>(0).map_err(DbError::from)?,
            None => None,
        };
        Ok(AppliedRecord::new(head))
    }
}

impl HistoryStore for PostgresHistoryStore<'_> {
    fn initialize(&self) -> Result<(), MigrationError> {
        let sql = r#"
            CREATE TABLE IF NOT EXISTS schemagate_version (
                id SMALLINT PRIMARY KEY CHECK (id = 1),
                version BIGINT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            INSERT INTO schemagate_version (id, version) VALUES (1, NULL)
                ON CONFLICT (id) DO NOTHING;
            CREATE TABLE IF NOT EXISTS schemagate_history (
                id BIGSERIAL PRIMARY KEY,
                version BIGINT NOT NULL,
                name VARCHAR(255) NOT NULL,
                checksum VARCHAR(64) NOT NULL,
                direction VARCHAR(4) NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                execution_time_ms BIGINT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_schemagate_history_version
                ON schemagate_history(version);
        "#;

        self.executor.batch_execute(sql)?;
        Ok(())
    }

    fn apply_script(
        &self,
        script: &MigrationScript,
        direction: Direction,
        new_head: Option<i64>,
    ) -> Result<HistoryEntry, MigrationError> {
        let sql = match direction {
            Direction::Up => &script.upgrade,
            Direction::Down => script.downgrade.as_ref().ok_or_else(|| {
                MigrationError::IrreversibleMigration {
                    version: script.version,
                    name: script.name(),
                }
            })?,
        };

        let start = Instant::now();
        let tx = Transaction::begin(self.executor)?;

        if is_blank_sql(sql) {
            log::debug!("migration {} has an empty {direction} section", script.version);
        } else {
            tx.batch_execute(sql)?;
        }

        tx.execute(
            "UPDATE schemagate_version SET version = $1, updated_at = NOW() WHERE id = 1",
            &[&new_head],
        )?;

        let execution_time_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
        let name = script.name();
        tx.execute(
            r#"
            INSERT INTO schemagate_history (version, name, checksum, direction, execution_time_ms)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            &[
                &script.version,
                &name,
                &script.checksum,
                &direction.as_str(),
                &execution_time_ms,
            ],
        )?;

        tx.commit()?;

        Ok(HistoryEntry::new(
            script.version,
            name,
            script.checksum.clone(),
            direction,
            Utc::now(),
            execution_time_ms,
        ))
    }

    fn try_lock(&self, owner: &str) -> Result<bool, MigrationError> {
        let row = self
            .executor
            .query_one("SELECT pg_try_advisory_lock($1)", &[&ADVISORY_LOCK_KEY])?;
        let acquired = row.try_get::<_, bool>(0).map_err(DbError::from)?;
        log::trace!("advisory lock attempt by {owner}: {acquired}");
        Ok(acquired)
    }

    fn unlock(&self, owner: &str) -> Result<(), MigrationError> {
        let row = self
            .executor
            .query_one("SELECT pg_advisory_unlock($1)", &[&ADVISORY_LOCK_KEY])?;
        let released = row.try_get::<_, bool>(0).map_err(DbError::from)?;
        if !released {
            log::warn!("advisory lock was not held by this session ({owner})");
        }
        Ok(())
    }

    fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        if !self.table_exists(HISTORY_TABLE)? {
            return Ok(Vec::new());
        }

        let rows = self.executor.query_all(
            r#"
            SELECT version, name, checksum, direction,
                   EXTRACT(EPOCH FROM applied_at)::BIGINT, execution_time_ms
            FROM schemagate_history
            ORDER BY id ASC
            "#,
            &[],
        )?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let direction: String = row.try_get(3).map_err(DbError::from)?;
            let direction = direction
                .parse::<Direction>()
                .map_err(DbError::Parse)?;
            let epoch: i64 = row.try_get(4).map_err(DbError::from)?;
            let applied_at = DateTime::<Utc>::from_timestamp(epoch, 0).ok_or_else(|| {
                DbError::Parse(format!("history timestamp {epoch} is out of range"))
            })?;

            entries.push(HistoryEntry::new(
                row.try_get(0).map_err(DbError::from)?,
                row.try_get(1).map_err(DbError::from)?,
                row.try_get(2).map_err(DbError::from)?,
                direction,
                applied_at,
                row.try_get(5).map_err(DbError::from)?,
            ));
        }
        Ok(entries)
    }
}

/// Reader that opens a fresh connection for every read
///
/// Used by the readiness probe, which must keep answering across database restarts.
/// Connection attempts give up after [`DEFAULT_CONNECT_TIMEOUT`] unless the URL sets
/// its own `connect_timeout`, so an unreachable host reads as unreachable quickly.
#[derive(Debug, Clone)]
pub struct PgHistoryReader {
    database_url: String,
    connect_timeout: Duration,
}

impl PgHistoryReader {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn connection_string(&self) -> String {
        with_connect_timeout(&self.database_url, self.connect_timeout)
    }
}

impl HistoryReader for PgHistoryReader {
    fn applied_record(&self) -> Result<AppliedRecord, MigrationError> {
        let executor = PgExecutor::new(connect(&self.connection_string())?);
        PostgresHistoryStore::new(&executor).applied_record()
    }
}
