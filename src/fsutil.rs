//! Locked, atomic file persistence
//!
//! Every JSON-backed store goes through here. Writes land in a sibling temp
//! file that is renamed over the target, so readers only ever see the old or
//! the new content. Cross-process exclusion uses advisory `flock` on a
//! sibling `.lock` file; the data file itself is replaced on every write, so
//! it cannot carry the lock.

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

#[cfg(unix)]
use nix::fcntl::{Flock, FlockArg};

/// Held advisory lock; released on drop
pub struct FileLock {
    #[cfg(unix)]
    _guard: Flock<File>,
    #[cfg(not(unix))]
    _file: File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Path of the lock file guarding `path`
pub fn lock_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

/// Block until the lock guarding `path` is acquired
pub fn lock(path: &Path, mode: LockMode) -> Result<FileLock> {
    let lock_file = lock_path(path);
    if let Some(parent) = lock_file.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_file)?;

    #[cfg(unix)]
    {
        let arg = match mode {
            LockMode::Shared => FlockArg::LockShared,
            LockMode::Exclusive => FlockArg::LockExclusive,
        };
        let guard = Flock::lock(file, arg).map_err(|(_, errno)| io::Error::from(errno))?;
        debug!("Acquired {:?} lock on {}", mode, lock_file.display());
        Ok(FileLock { _guard: guard })
    }

    #[cfg(not(unix))]
    {
        debug!("Advisory locks unsupported, opened {:?} {}", mode, lock_file.display());
        Ok(FileLock { _file: file })
    }
}

/// Write `bytes` to `path` via temp file + rename
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let mut tmp = NamedTempFile::new_in(&parent)?;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &content)
}

/// Read and decode a JSON file; a missing file becomes [`Error::FileNotFound`]
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = match fs::read(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(Error::FileNotFound(path.to_path_buf()));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&content)?)
}

/// Remove a file, returning whether it existed
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tempfile::TempDir;

    #[test]
    fn test_lock_path() {
        let path = Path::new("/tmp/protonvpn/servers.json");
        assert_eq!(lock_path(path), PathBuf::from("/tmp/protonvpn/servers.json.lock"));
    }

    #[test]
    fn test_write_and_read_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sub").join("data.json");

        write_json_atomic(&path, &json!({"a": 1})).unwrap();
        let value: Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 1);

        write_json_atomic(&path, &json!({"a": 2})).unwrap();
        let value: Value = read_json(&path).unwrap();
        assert_eq!(value["a"], 2);
    }

    #[test]
    fn test_write_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.json");
        write_json_atomic(&path, &json!({"k": "v"})).unwrap();

        let entries: Vec<_> = fs::read_dir(temp_dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], "data.json");
    }

    #[test]
    fn test_read_missing_is_file_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("missing.json");
        let result: Result<Value> = read_json(&path);
        assert!(matches!(result, Err(Error::FileNotFound(p)) if p == path));
    }

    #[test]
    fn test_read_corrupt_is_json_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.json");
        fs::write(&path, "{not json").unwrap();
        let result: Result<Value> = read_json(&path);
        assert!(matches!(result, Err(Error::Json(_))));
    }

    #[test]
    fn test_remove_if_exists() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("gone.json");
        fs::write(&path, "{}").unwrap();

        assert!(remove_if_exists(&path).unwrap());
        assert!(!remove_if_exists(&path).unwrap());
    }

    #[test]
    fn test_lock_and_relock() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data.json");

        {
            let _guard = lock(&path, LockMode::Exclusive).unwrap();
            assert!(lock_path(&path).exists());
        }
        let _a = lock(&path, LockMode::Shared).unwrap();
        let _b = lock(&path, LockMode::Shared).unwrap();
    }
}
