// File helpers for the queue document: atomic replace and a sidecar
// advisory lock shared by every process that touches the queue.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::StoreError;

/// Atomically replace `path` with `contents` using write-to-temp + rename.
///
/// The temp file lives in the same directory so the rename never crosses a
/// filesystem. On any failure the previous document is left in place.
pub fn atomic_write(path: &Path, contents: &str) -> Result<(), StoreError> {
    let parent = parent_dir(path);
    fs::create_dir_all(&parent).map_err(|e| StoreError::io(&parent, e))?;

    let temp_path = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("queue"),
        std::process::id()
    ));

    let written = File::create(&temp_path)
        .and_then(|mut file| {
            file.write_all(contents.as_bytes())?;
            file.sync_all()
        })
        .and_then(|()| fs::rename(&temp_path, path));

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(StoreError::io(path, e));
    }
    Ok(())
}

/// Held advisory lock on the sidecar lock file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl FileLock {
    /// Block until the lock on `lock_path` is acquired, creating the file if needed.
    pub fn acquire(lock_path: &Path, mode: LockMode) -> Result<Self, StoreError> {
        let parent = parent_dir(lock_path);
        fs::create_dir_all(&parent).map_err(|e| StoreError::io(&parent, e))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)
            .map_err(|e| StoreError::io(lock_path, e))?;

        let locked = match mode {
            LockMode::Shared => FileExt::lock_shared(&file),
            LockMode::Exclusive => FileExt::lock_exclusive(&file),
        };
        locked.map_err(|source| StoreError::Lock {
            path: lock_path.to_path_buf(),
            source,
        })?;

        Ok(Self { _file: file })
    }
}

/// `<dir>/<name>.lock` next to the document.
pub fn lock_path_for(path: &Path) -> PathBuf {
    sibling(path, "lock")
}

/// `<dir>/<name>.corrupt` next to the document.
pub fn corrupt_path_for(path: &Path) -> PathBuf {
    sibling(path, "corrupt")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "queue".to_string());
    parent_dir(path).join(format!("{name}.{suffix}"))
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_creates_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");

        atomic_write(&path, "[]").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[]");

        atomic_write(&path, "[1]").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[1]");
    }

    #[test]
    fn atomic_write_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        atomic_write(&path, "[]").unwrap();

        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["queue.json"]);
    }

    #[test]
    fn atomic_write_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/deeper/queue.json");
        atomic_write(&path, "[]").unwrap();
        assert!(path.exists());
    }

    #[test]
    fn failed_write_keeps_previous_document() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.json");
        atomic_write(&path, "[\"old\"]").unwrap();

        // A directory squatting on the target makes the rename fail.
        let blocked = dir.path().join("blocked");
        fs::create_dir_all(blocked.join("inner")).unwrap();
        assert!(atomic_write(&blocked, "[]").is_err());

        assert_eq!(fs::read_to_string(&path).unwrap(), "[\"old\"]");
    }

    #[test]
    fn sidecar_paths() {
        let path = Path::new("/data/reminder.json");
        assert_eq!(lock_path_for(path), PathBuf::from("/data/reminder.json.lock"));
        assert_eq!(corrupt_path_for(path), PathBuf::from("/data/reminder.json.corrupt"));
        assert_eq!(lock_path_for(Path::new("reminder.json")), PathBuf::from("./reminder.json.lock"));
    }

    #[test]
    fn shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("q.lock");
        let a = FileLock::acquire(&lock, LockMode::Shared).unwrap();
        let b = FileLock::acquire(&lock, LockMode::Shared).unwrap();
        drop((a, b));
        let _c = FileLock::acquire(&lock, LockMode::Exclusive).unwrap();
    }
}
