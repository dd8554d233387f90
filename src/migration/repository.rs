//! Script repository: the directory of `m{version}_{slug}.sql` files

use crate::migration::{MigrationChain, MigrationError, MigrationScript};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Directory-backed store of migration scripts
#[derive(Debug, Clone)]
pub struct ScriptRepository {
    dir: PathBuf,
}

impl ScriptRepository {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Discover and parse every script in the directory
    ///
    /// A missing directory is an empty repository. Files without the `.sql`
    /// extension are ignored; a `.sql` file with a malformed name or header is an error.
    /// Scripts are returned sorted by version (the chain order comes from [`Self::chain`]).
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the directory cannot be read, or
    /// `MigrationError::InvalidFormat` for a malformed script.
    pub fn load(&self) -> Result<Vec<MigrationScript>, MigrationError> {
        if !self.dir.exists() {
            log::debug!(
                "migrations directory {} does not exist; treating it as empty",
                self.dir.display()
            );
            return Ok(Vec::new());
        }

        if !self.dir.is_dir() {
            return Err(MigrationError::InvalidFormat(format!(
                "Path is not a directory: {}",
                self.dir.display()
            )));
        }

        let entries = fs::read_dir(&self.dir).map_err(|e| MigrationError::io(&self.dir, e))?;

        let mut scripts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| MigrationError::io(&self.dir, e))?;
            let path = entry.path();

            if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some("sql") {
                continue;
            }

            scripts.push(MigrationScript::from_file(&path)?);
        }

        scripts.sort_by_key(|s| s.version);
        log::debug!("loaded {} migration script(s) from {}", scripts.len(), self.dir.display());
        Ok(scripts)
    }

    /// Load the scripts and link them into a validated chain
    ///
    /// # Errors
    ///
    /// Returns the errors of [`Self::load`] and [`MigrationChain::build`].
    pub fn chain(&self) -> Result<MigrationChain, MigrationError> {
        MigrationChain::build(self.load()?)
    }

    /// Write a new script file, creating the directory if needed
    ///
    /// Existing files are never overwritten. Returns the script with its `path` set.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Io` if the directory cannot be created or the file
    /// already exists or cannot be written.
    pub fn write(&self, script: &MigrationScript) -> Result<MigrationScript, MigrationError> {
        fs::create_dir_all(&self.dir).map_err(|e| MigrationError::io(&self.dir, e))?;

        let path = self.dir.join(script.file_name());
        let contents = script.render();
        write_new_file(&path, |file| file.write_all(contents.as_bytes()))?;

        log::info!("wrote migration script {}", path.display());

        let mut written = script.clone();
        written.path = Some(path);
        Ok(written)
    }
}

/// Create `path` (which must not exist) and fill it
///
/// A file that fails to fill is removed again, so no truncated script is left behind.
fn write_new_file<F>(path: &Path, fill: F) -> Result<(), MigrationError>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|e| MigrationError::io(path, e))?;

    if let Err(e) = fill(&mut file).and_then(|()| file.sync_all()) {
        drop(file);
        if let Err(cleanup) = fs::remove_file(path) {
            log::warn!(
                "could not remove partial migration script {}: {}",
                path.display(),
                cleanup
            );
        }
        return Err(MigrationError::io(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn script(version: i64, predecessor: Option<i64>) -> MigrationScript {
        MigrationScript::new(
            version,
            "create users",
            predecessor,
            "CREATE TABLE users (id uuid PRIMARY KEY);".to_string(),
            Some("DROP TABLE users;".to_string()),
            Utc::now(),
        )
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = ScriptRepository::new(dir.path().join("nope"));
        assert!(repo.load().expect("load").is_empty());
        assert!(repo.chain().expect("chain").is_empty());
    }

    #[test]
    fn test_write_then_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = ScriptRepository::new(dir.path().join("migrations"));

        let written = repo.write(&script(20240101000000, None)).expect("write");
        let path = written.path.clone().expect("path");
        assert!(path.ends_with("m20240101000000_create_users.sql"));

        let loaded = repo.load().expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].version, 20240101000000);
        assert_eq!(loaded[0].checksum, written.checksum);
    }

    #[test]
    fn test_write_never_overwrites() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = ScriptRepository::new(dir.path());
        repo.write(&script(20240101000000, None)).expect("first write");

        let err = repo.write(&script(20240101000000, None)).expect_err("second write");
        assert!(matches!(err, MigrationError::Io { .. }));
    }

    #[test]
    fn test_failed_write_leaves_no_partial_script() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = ScriptRepository::new(dir.path());
        let path = dir.path().join(script(20240101000000, None).file_name());

        let err = write_new_file(&path, |file| {
            file.write_all(b"-- schemagate:migration\n-- version: 2024")?;
            Err(io::Error::new(io::ErrorKind::Other, "no space left on device"))
        })
        .expect_err("fill fails");

        assert!(matches!(err, MigrationError::Io { .. }));
        assert!(!path.exists());
        assert!(repo.load().expect("load").is_empty());

        repo.write(&script(20240101000000, None)).expect("retry");
        assert_eq!(repo.load().expect("load").len(), 1);
    }

    #[test]
    fn test_ignores_other_files_and_rejects_bad_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = ScriptRepository::new(dir.path());
        repo.write(&script(20240101000000, None)).expect("write");
        fs::write(dir.path().join("README.md"), "notes").expect("readme");

        assert_eq!(repo.load().expect("load").len(), 1);

        fs::write(dir.path().join("fix.sql"), "SELECT 1;").expect("bad");
        assert!(matches!(repo.load(), Err(MigrationError::InvalidFormat(_))));
    }
}
