//! Records kept by the history store

use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

/// The single applied-state row: which script the database is at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AppliedRecord {
    /// Version of the last successfully applied script; `None` before the first apply
    pub head: Option<i64>,
}

impl AppliedRecord {
    #[must_use]
    pub fn new(head: Option<i64>) -> Self {
        Self { head }
    }
}

impl fmt::Display for AppliedRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.head {
            Some(v) => write!(f, "{v}"),
            None => write!(f, "base"),
        }
    }
}

/// Which transformation of a script was run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            other => Err(format!("unknown migration direction '{other}'")),
        }
    }
}

/// One line of the append-only history log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Script version
    pub version: i64,

    /// Script slug
    pub name: String,

    /// `SHA-256` of the script file at the time it ran
    pub checksum: String,

    pub direction: Direction,

    /// When the transformation committed
    pub applied_at: DateTime<Utc>,

    /// Execution time in milliseconds
    pub execution_time_ms: i64,
}

impl HistoryEntry {
    #[must_use]
    pub fn new(
        version: i64,
        name: String,
        checksum: String,
        direction: Direction,
        applied_at: DateTime<Utc>,
        execution_time_ms: i64,
    ) -> Self {
        Self {
            version,
            name,
            checksum,
            direction,
            applied_at,
            execution_time_ms,
        }
    }
}
