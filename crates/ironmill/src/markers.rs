//! Durable phase-completion markers.
//!
//! A marker is a sentinel file `<dir>/<key>.done`. Nothing is cached in memory;
//! every call goes to the filesystem, so separate invocations always agree on
//! what has completed.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Error, Result};

pub const MARKER_EXT: &str = "done";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MarkerRecord {
    pub key: String,
    pub completed_at: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MarkerStore {
    dir: PathBuf,
}

impl MarkerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.{MARKER_EXT}")))
    }

    /// A missing marker directory means no markers are set.
    pub fn has(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Create-if-absent. The sentinel is written to a temp file and renamed
    /// into place, so an interrupted write never leaves a marker behind.
    pub fn set(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        if path.is_file() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(|e| {
            Error::io(format!("failed to create marker dir {}", self.dir.display()), e)
        })?;

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .map_err(|e| Error::io(format!("failed to stage marker '{key}'"), e))?;
        writeln!(tmp, "completed_at={}", chrono::Utc::now().to_rfc3339())
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| Error::io(format!("failed to write marker '{key}'"), e))?;

        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::io(
                format!("failed to commit marker {}", path.display()),
                e.error,
            )),
        }
    }

    pub fn clear(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(
                format!("failed to clear marker {}", path.display()),
                e,
            )),
        }
    }

    pub fn clear_all(&self) -> Result<()> {
        for record in self.list()? {
            self.clear(&record.key)?;
        }
        Ok(())
    }

    pub fn list(&self) -> Result<Vec<MarkerRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::io(
                    format!("failed to read marker dir {}", self.dir.display()),
                    e,
                ));
            }
        };

        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| {
                Error::io(format!("failed to read marker dir {}", self.dir.display()), e)
            })?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(MARKER_EXT) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_key(key).is_err() {
                continue;
            }
            let completed_at = fs::read_to_string(&path).ok().and_then(|body| {
                body.lines()
                    .find_map(|l| l.strip_prefix("completed_at="))
                    .map(|s| s.trim().to_string())
            });
            out.push(MarkerRecord {
                key: key.to_string(),
                completed_at,
            });
        }
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(Error::msg(format!(
            "invalid marker key '{key}' (allowed: a-zA-Z0-9_-)"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_dir_means_no_markers() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MarkerStore::new(tmp.path().join("never-created"));
        assert!(!store.has("fetch"));
        assert!(store.list().expect("list").is_empty());
        store.clear_all().expect("clear_all on missing dir");
    }

    #[test]
    fn set_creates_dir_lazily_and_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MarkerStore::new(tmp.path().join("markers"));

        store.set("prune-patch").expect("first set");
        let first = fs::read_to_string(store.path_for("prune-patch").unwrap()).expect("read");
        store.set("prune-patch").expect("second set");
        let second = fs::read_to_string(store.path_for("prune-patch").unwrap()).expect("read");

        assert!(store.has("prune-patch"));
        assert_eq!(first, second, "second set must not rewrite the sentinel");
        assert!(first.starts_with("completed_at="));
    }

    #[test]
    fn set_leaves_no_staging_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MarkerStore::new(tmp.path());
        store.set("fetch").expect("set");
        let names: Vec<_> = fs::read_dir(tmp.path())
            .expect("read_dir")
            .map(|e| e.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("fetch.done")]);
    }

    #[test]
    fn clear_and_clear_all() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MarkerStore::new(tmp.path());
        store.set("fetch").expect("set");
        store.set("toolchain").expect("set");
        fs::write(tmp.path().join("notes.txt"), "keep me").expect("unrelated file");

        store.clear("fetch").expect("clear");
        store.clear("fetch").expect("clear twice");
        assert!(!store.has("fetch"));
        assert!(store.has("toolchain"));

        store.clear_all().expect("clear_all");
        assert!(!store.has("toolchain"));
        assert!(tmp.path().join("notes.txt").is_file());
    }

    #[test]
    fn list_reports_keys_and_timestamps() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MarkerStore::new(tmp.path());
        store.set("toolchain").expect("set");
        store.set("configure").expect("set");

        let list = store.list().expect("list");
        let keys: Vec<_> = list.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["configure", "toolchain"]);
        assert!(list.iter().all(|r| r.completed_at.is_some()));
    }

    #[test]
    fn rejects_path_like_keys() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let store = MarkerStore::new(tmp.path());
        assert!(store.set("../escape").is_err());
        assert!(store.set("").is_err());
        assert!(!store.has("a/b"));
    }
}
