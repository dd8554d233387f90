//! In-process history store
//!
//! Backs `apply --dry-run` and the test suites. Transformations are recorded but
//! not executed; every other rule (locking, one head move per script, history log)
//! behaves like the PostgreSQL store.

use crate::executor::DbError;
use crate::migration::{
    AppliedRecord, Direction, HistoryEntry, HistoryReader, HistoryStore, MigrationError,
    MigrationScript,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Debug, Default)]
struct MemoryState {
    initialized: bool,
    head: Option<i64>,
    history: Vec<HistoryEntry>,
    lock_owner: Option<String>,
    failures: HashMap<i64, String>,
    apply_delay: Option<Duration>,
    unreachable: bool,
}

/// History store held in memory
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that already sits at `head`
    pub fn with_head(head: Option<i64>) -> Self {
        let store = Self::default();
        {
            let mut state = store.state();
            state.initialized = true;
            state.head = head;
        }
        store
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current head
    pub fn head(&self) -> Option<i64> {
        self.state().head
    }

    /// Whether `initialize` has run
    pub fn is_initialized(&self) -> bool {
        self.state().initialized
    }

    /// Owner of the apply lock, if taken
    pub fn lock_owner(&self) -> Option<String> {
        self.state().lock_owner.clone()
    }

    /// `(version, direction)` of every transformation that ran, oldest first
    pub fn applied_log(&self) -> Vec<(i64, Direction)> {
        self.state()
            .history
            .iter()
            .map(|e| (e.version, e.direction))
            .collect()
    }

    fn check_reachable(state: &MemoryState) -> Result<(), MigrationError> {
        if state.unreachable {
            return Err(MigrationError::Database(DbError::Other(
                "history store is unreachable".to_string(),
            )));
        }
        Ok(())
    }
}

/// Failure injection for test suites; hidden from the documented API
impl MemoryHistoryStore {
    /// Make the transformation of `version` fail with `message`
    #[doc(hidden)]
    pub fn fail_on(&self, version: i64, message: impl Into<String>) {
        self.state().failures.insert(version, message.into());
    }

    /// Clear a failure set by [`Self::fail_on`]
    #[doc(hidden)]
    pub fn clear_failure(&self, version: i64) {
        self.state().failures.remove(&version);
    }

    /// Sleep this long inside every transformation, to widen race windows in tests
    #[doc(hidden)]
    pub fn set_apply_delay(&self, delay: Duration) {
        self.state().apply_delay = Some(delay);
    }

    /// Make every read fail as if the database were down
    #[doc(hidden)]
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }
}

impl HistoryReader for MemoryHistoryStore {
    fn applied_record(&self) -> Result<AppliedRecord, MigrationError> {
        let state = self.state();
        Self::check_reachable(&state)?;
        Ok(AppliedRecord::new(state.head))
    }
}

impl HistoryStore for MemoryHistoryStore {
    fn initialize(&self) -> Result<(), MigrationError> {
        let mut state = self.state();
        Self::check_reachable(&state)?;
        state.initialized = true;
        Ok(())
    }

    fn apply_script(
        &self,
        script: &MigrationScript,
        direction: Direction,
        new_head: Option<i64>,
    ) -> Result<HistoryEntry, MigrationError> {
        let delay = self.state().apply_delay;
        if let Some(delay) = delay {
            // sleep without holding the state lock so readers stay unblocked
            std::thread::sleep(delay);
        }

        let mut state = self.state();
        Self::check_reachable(&state)?;

        if direction == Direction::Down && script.downgrade.is_none() {
            return Err(MigrationError::IrreversibleMigration {
                version: script.version,
                name: script.name(),
            });
        }
        if let Some(message) = state.failures.get(&script.version) {
            return Err(MigrationError::Database(DbError::Query(message.clone())));
        }

        let entry = HistoryEntry::new(
            script.version,
            script.name(),
            script.checksum.clone(),
            direction,
            Utc::now(),
            delay.map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX)),
        );
        state.head = new_head;
        state.history.push(entry.clone());
        Ok(entry)
    }

    fn try_lock(&self, owner: &str) -> Result<bool, MigrationError> {
        let mut state = self.state();
        Self::check_reachable(&state)?;
        if state.lock_owner.is_some() {
            return Ok(false);
        }
        state.lock_owner = Some(owner.to_string());
        Ok(true)
    }

    fn unlock(&self, owner: &str) -> Result<(), MigrationError> {
        let mut state = self.state();
        match state.lock_owner.as_deref() {
            Some(current) if current == owner => {
                state.lock_owner = None;
            }
            other => {
                log::warn!("unlock by {owner} ignored; lock is held by {other:?}");
            }
        }
        Ok(())
    }

    fn history(&self) -> Result<Vec<HistoryEntry>, MigrationError> {
        let state = self.state();
        Self::check_reachable(&state)?;
        Ok(state.history.clone())
    }
}
