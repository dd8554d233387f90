//! Migration script files
//!
//! A script is a plain SQL file named `m{YYYYMMDDHHMMSS}_{slug}.sql` with a small
//! comment header linking it to its predecessor:
//!
//! ```text
//! -- schemagate:migration
//! -- version: 20240120120000
//! -- message: add onboarding flag
//! -- predecessor: 20240101000000
//! -- created: 2024-01-20T12:00:00+00:00
//!
//! -- +upgrade
//! ALTER TABLE "users" ADD COLUMN "onboarded" boolean;
//!
//! -- +downgrade
//! ALTER TABLE "users" DROP COLUMN "onboarded";
//! ```
//!
//! A script without a `-- +downgrade` section is irreversible.

use crate::migration::MigrationError;
use chrono::{DateTime, Datelike, SecondsFormat, Timelike, Utc};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Message used when `generate` is called without one
pub const DEFAULT_MESSAGE: &str = "auto migration";

const MARKER: &str = "-- schemagate:migration";
const UPGRADE_SECTION: &str = "-- +upgrade";
const DOWNGRADE_SECTION: &str = "-- +downgrade";
const MAX_SLUG_LEN: usize = 60;

/// One versioned migration script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationScript {
    /// Unique identifier (creation timestamp `YYYYMMDDHHMMSS`, bumped to stay monotonic)
    pub version: i64,

    /// Human-readable message
    pub message: String,

    /// Version of the script this one follows; `None` for the root
    pub predecessor: Option<i64>,

    /// Forward transformation
    pub upgrade: String,

    /// Inverse transformation, if the script is reversible
    pub downgrade: Option<String>,

    /// When the script was generated
    pub created_at: DateTime<Utc>,

    /// `SHA-256` of the file content
    pub checksum: String,

    /// Where the script was loaded from or written to
    pub path: Option<PathBuf>,
}

impl MigrationScript {
    /// Build a new script; the checksum is computed from the rendered file
    pub fn new(
        version: i64,
        message: &str,
        predecessor: Option<i64>,
        upgrade: String,
        downgrade: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let message = normalize_message(message);
        let mut script = Self {
            version,
            message,
            predecessor,
            upgrade: upgrade.trim().to_string(),
            downgrade: downgrade.map(|d| d.trim().to_string()),
            // truncate to whole seconds so the header round-trips
            created_at: created_at.with_nanosecond(0).unwrap_or(created_at),
            checksum: String::new(),
            path: None,
        };
        script.checksum = calculate_checksum(&script.render());
        script
    }

    /// Slug derived from the message, used in the file name and the history log
    pub fn name(&self) -> String {
        slugify(&self.message)
    }

    /// File name of the script: `m{version}_{slug}.sql`
    pub fn file_name(&self) -> String {
        format!("m{}_{}.sql", self.version, self.name())
    }

    /// Whether the script carries a downgrade section
    pub fn is_reversible(&self) -> bool {
        self.downgrade.is_some()
    }

    /// Render the file content
    pub fn render(&self) -> String {
        let predecessor = self
            .predecessor
            .map_or_else(|| "none".to_string(), |p| p.to_string());

        let mut out = String::new();
        out.push_str(MARKER);
        out.push('\n');
        out.push_str(&format!("-- version: {}\n", self.version));
        out.push_str(&format!("-- message: {}\n", self.message));
        out.push_str(&format!("-- predecessor: {predecessor}\n"));
        out.push_str(&format!(
            "-- created: {}\n",
            self.created_at.to_rfc3339_opts(SecondsFormat::Secs, false)
        ));
        out.push('\n');
        out.push_str(UPGRADE_SECTION);
        out.push('\n');
        if !self.upgrade.is_empty() {
            out.push_str(&self.upgrade);
            out.push('\n');
        }
        if let Some(downgrade) = &self.downgrade {
            out.push('\n');
            out.push_str(DOWNGRADE_SECTION);
            out.push('\n');
            if !downgrade.is_empty() {
                out.push_str(downgrade);
                out.push('\n');
            }
        }
        out
    }

    /// Parse a script from its file name and content
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidFormat` if the file name does not match
    /// `m{YYYYMMDDHHMMSS}_{slug}.sql`, the header is incomplete, or the header version
    /// disagrees with the file name.
    pub fn parse(file_name: &str, content: &str) -> Result<Self, MigrationError> {
        let (file_version, _slug) = parse_filename(file_name)?;

        let mut lines = content.lines().skip_while(|l| l.trim().is_empty());
        match lines.next() {
            Some(first) if first.trim() == MARKER => {}
            _ => {
                return Err(MigrationError::InvalidFormat(format!(
                    "{file_name}: missing '{MARKER}' header"
                )))
            }
        }

        let mut version = None;
        let mut message = None;
        let mut predecessor = None;
        let mut created_at = None;
        let mut upgrade: Option<Vec<&str>> = None;
        let mut downgrade: Option<Vec<&str>> = None;

        for line in lines {
            let trimmed = line.trim();
            if trimmed == UPGRADE_SECTION {
                upgrade = Some(Vec::new());
                continue;
            }
            if trimmed == DOWNGRADE_SECTION {
                downgrade = Some(Vec::new());
                continue;
            }
            if let Some(body) = downgrade.as_mut() {
                body.push(line);
                continue;
            }
            if let Some(body) = upgrade.as_mut() {
                body.push(line);
                continue;
            }

            // still in the header
            if trimmed.is_empty() {
                continue;
            }
            let Some(comment) = trimmed.strip_prefix("--") else {
                return Err(MigrationError::InvalidFormat(format!(
                    "{file_name}: statement outside of a '{UPGRADE_SECTION}' section: '{trimmed}'"
                )));
            };
            let Some((key, value)) = comment.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim() {
                "version" => {
                    version = Some(value.parse::<i64>().map_err(|_| {
                        MigrationError::InvalidFormat(format!(
                            "{file_name}: invalid version '{value}'"
                        ))
                    })?);
                }
                "message" => message = Some(value.to_string()),
                "predecessor" => {
                    predecessor = Some(if value.eq_ignore_ascii_case("none") {
                        None
                    } else {
                        Some(value.parse::<i64>().map_err(|_| {
                            MigrationError::InvalidFormat(format!(
                                "{file_name}: invalid predecessor '{value}'"
                            ))
                        })?)
                    });
                }
                "created" => {
                    let parsed = DateTime::parse_from_rfc3339(value).map_err(|e| {
                        MigrationError::InvalidFormat(format!(
                            "{file_name}: invalid created timestamp '{value}': {e}"
                        ))
                    })?;
                    created_at = Some(parsed.with_timezone(&Utc));
                }
                other => {
                    log::debug!("{file_name}: ignoring unknown header key '{other}'");
                }
            }
        }

        let missing = |field: &str| {
            MigrationError::InvalidFormat(format!("{file_name}: missing '{field}' header"))
        };
        let version = version.ok_or_else(|| missing("version"))?;
        let predecessor = predecessor.ok_or_else(|| missing("predecessor"))?;
        let created_at = created_at.ok_or_else(|| missing("created"))?;
        let upgrade = upgrade.ok_or_else(|| missing(UPGRADE_SECTION))?;

        if version != file_version {
            return Err(MigrationError::InvalidFormat(format!(
                "{file_name}: header version {version} does not match file name version {file_version}"
            )));
        }
        if predecessor == Some(version) {
            return Err(MigrationError::InvalidFormat(format!(
                "{file_name}: script cannot be its own predecessor"
            )));
        }

        Ok(Self {
            version,
            message: message.unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            predecessor,
            upgrade: upgrade.join("\n").trim().to_string(),
            downgrade: downgrade.map(|d| d.join("\n").trim().to_string()),
            created_at,
            checksum: calculate_checksum(content),
            path: None,
        })
    }

    /// Read and parse a script file
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the file cannot be read, or the errors of [`Self::parse`].
    pub fn from_file(path: &Path) -> Result<Self, MigrationError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                MigrationError::InvalidFormat(format!("Invalid filename: {}", path.display()))
            })?;
        let content =
            std::fs::read_to_string(path).map_err(|e| MigrationError::io(path, e))?;

        let mut script = Self::parse(file_name, &content)?;
        script.path = Some(path.to_path_buf());
        Ok(script)
    }
}

/// Parse a script file name into `(version, slug)`
///
/// Expected format: `m{YYYYMMDDHHMMSS}_{slug}.sql`
///
/// # Errors
///
/// Returns `MigrationError::InvalidFormat` if the name does not match.
pub fn parse_filename(file_name: &str) -> Result<(i64, String), MigrationError> {
    let re = Regex::new(r"^m(\d{14})_([a-z0-9_]+)\.sql$")
        .map_err(|e| MigrationError::InvalidFormat(format!("Invalid regex: {e}")))?;

    let invalid = || {
        MigrationError::InvalidFormat(format!(
            "Migration file name '{file_name}' does not match expected pattern: m{{YYYYMMDDHHMMSS}}_{{slug}}.sql"
        ))
    };

    let caps = re.captures(file_name).ok_or_else(invalid)?;
    let version = caps
        .get(1)
        .and_then(|m| m.as_str().parse::<i64>().ok())
        .ok_or_else(invalid)?;
    let slug = caps.get(2).map(|m| m.as_str().to_string()).ok_or_else(invalid)?;

    Ok((version, slug))
}

/// Next script version: `now` as `YYYYMMDDHHMMSS`, or `tip + 1` when that is not newer
pub fn next_version(now: DateTime<Utc>, tip: Option<i64>) -> i64 {
    let stamp = i64::from(now.year()) * 10_000_000_000
        + i64::from(now.month()) * 100_000_000
        + i64::from(now.day()) * 1_000_000
        + i64::from(now.hour()) * 10_000
        + i64::from(now.minute()) * 100
        + i64::from(now.second());

    match tip {
        Some(tip) if stamp <= tip => tip + 1,
        _ => stamp,
    }
}

/// Lowercase the message and collapse anything non-alphanumeric into `_`
pub fn slugify(message: &str) -> String {
    let mut slug = String::with_capacity(message.len());
    for c in message.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }

    let mut slug = slug.trim_matches('_').to_string();
    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        slug = slug.trim_end_matches('_').to_string();
    }

    if slug.is_empty() {
        "migration".to_string()
    } else {
        slug
    }
}

/// Calculate the hexadecimal `SHA-256` of script content
pub fn calculate_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn normalize_message(message: &str) -> String {
    let joined = message.split_whitespace().collect::<Vec<_>>().join(" ");
    if joined.is_empty() {
        DEFAULT_MESSAGE.to_string()
    } else {
        joined
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single().expect("valid timestamp")
    }

    #[test]
    fn test_parse_filename() {
        let (version, slug) = parse_filename("m20240120120000_add_column.sql").expect("parse");
        assert_eq!(version, 20240120120000);
        assert_eq!(slug, "add_column");

        assert!(parse_filename("m2024_add_column.sql").is_err());
        assert!(parse_filename("m20240120120000_add_column.rs").is_err());
        assert!(parse_filename("20240120120000_add_column.sql").is_err());
        assert!(parse_filename("m20240120120000_Add-Column.sql").is_err());
    }

    #[test]
    fn test_next_version_uses_timestamp() {
        let now = at(2024, 1, 20, 12, 0, 0);
        assert_eq!(next_version(now, None), 20240120120000);
        assert_eq!(next_version(now, Some(20240101000000)), 20240120120000);
    }

    #[test]
    fn test_next_version_stays_monotonic() {
        let now = at(2024, 1, 20, 12, 0, 0);
        assert_eq!(next_version(now, Some(20240120120000)), 20240120120001);
        assert_eq!(next_version(now, Some(20250101000000)), 20250101000001);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("auto migration"), "auto_migration");
        assert_eq!(slugify("Add users.email index!"), "add_users_email_index");
        assert_eq!(slugify("  --  "), "migration");
        assert_eq!(slugify("добавить таблицу"), "migration");
        assert!(slugify(&"x".repeat(200)).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn test_render_and_parse() {
        let script = MigrationScript::new(
            20240120120000,
            "add onboarding flag",
            Some(20240101000000),
            "ALTER TABLE \"users\" ADD COLUMN \"onboarded\" boolean;".to_string(),
            Some("ALTER TABLE \"users\" DROP COLUMN \"onboarded\";".to_string()),
            at(2024, 1, 20, 12, 0, 0),
        );
        let content = script.render();
        assert!(content.starts_with(MARKER));
        assert!(content.contains("-- predecessor: 20240101000000"));
        assert!(content.contains("-- created: 2024-01-20T12:00:00+00:00"));

        let parsed = MigrationScript::parse(&script.file_name(), &content).expect("parse");
        assert_eq!(parsed, script);
        assert_eq!(script.file_name(), "m20240120120000_add_onboarding_flag.sql");
    }

    #[test]
    fn test_parse_without_downgrade_is_irreversible() {
        let content = "-- schemagate:migration\n\
                       -- version: 20240120120000\n\
                       -- message: backfill\n\
                       -- predecessor: none\n\
                       -- created: 2024-01-20T12:00:00+00:00\n\
                       \n\
                       -- +upgrade\n\
                       UPDATE users SET name = '' WHERE name IS NULL;\n";
        let script = MigrationScript::parse("m20240120120000_backfill.sql", content).expect("parse");
        assert_eq!(script.predecessor, None);
        assert!(!script.is_reversible());
        assert_eq!(script.checksum, calculate_checksum(content));
    }

    #[test]
    fn test_parse_rejects_version_mismatch() {
        let script = MigrationScript::new(
            20240120120000,
            "x",
            None,
            String::new(),
            None,
            at(2024, 1, 20, 12, 0, 0),
        );
        let err = MigrationScript::parse("m20240120120001_x.sql", &script.render())
            .expect_err("mismatch");
        assert!(matches!(err, MigrationError::InvalidFormat(_)));
    }

    #[test]
    fn test_parse_rejects_missing_header() {
        let err = MigrationScript::parse("m20240120120000_x.sql", "-- +upgrade\nSELECT 1;\n")
            .expect_err("no marker");
        assert!(err.to_string().contains("schemagate:migration"));

        let err = MigrationScript::parse(
            "m20240120120000_x.sql",
            "-- schemagate:migration\n-- version: 20240120120000\n-- +upgrade\n",
        )
        .expect_err("no predecessor");
        assert!(err.to_string().contains("predecessor"));
    }

    #[test]
    fn test_blank_message_defaults() {
        let script = MigrationScript::new(1, "   ", None, String::new(), None, Utc::now());
        assert_eq!(script.message, DEFAULT_MESSAGE);
        assert_eq!(script.name(), "auto_migration");
    }
}
