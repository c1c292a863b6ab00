use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use herald_core::QueueItem;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::fs::{atomic_write, corrupt_path_for, lock_path_for, FileLock, LockMode};

/// File-backed FIFO of pending items.
///
/// Every operation runs inside one critical section: an in-process mutex
/// (broadcast loop vs. acknowledgment handlers) followed by an advisory lock
/// on `<file>.lock` (other processes appending through this type). Writes
/// replace the whole document atomically, so a reader never sees a partial
/// file even if it skips the lock.
pub struct QueueStore {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock_path = lock_path_for(&path);
        Self {
            path,
            lock_path,
            guard: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current queue contents. Missing or malformed documents read as empty.
    pub fn load(&self) -> Vec<QueueItem> {
        match self.try_load() {
            Ok(items) => items,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to load queue, treating as empty");
                Vec::new()
            }
        }
    }

    /// Strict variant of [`load`](Self::load). A missing or blank file is
    /// still `Ok(vec![])`; a document that is not JSON, or not an array or
    /// object, is `StoreError::Malformed`. Individual records that do not
    /// decode are skipped with a warning and stay in the file.
    pub fn try_load(&self) -> Result<Vec<QueueItem>, StoreError> {
        let _guard = self.guard.lock();
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Shared)?;
        let entries = self.read_document()?;
        Ok(self.decode(entries))
    }

    /// First item in delivery order.
    pub fn head(&self) -> Option<QueueItem> {
        self.load().into_iter().next()
    }

    pub fn len(&self) -> usize {
        self.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the whole queue.
    pub fn save(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        let _guard = self.guard.lock();
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Exclusive)?;
        self.write_document(items)
    }

    /// Remove every item whose `request_id` equals `id`, keeping the rest in
    /// order. Returns whether anything was removed; when nothing matches the
    /// document is not rewritten.
    pub fn remove_by_id(&self, id: &str) -> Result<bool, StoreError> {
        let _guard = self.guard.lock();
        if !self.path.exists() {
            return Ok(false);
        }
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Exclusive)?;

        let entries = match self.read_document() {
            Ok(entries) => entries,
            Err(e) if e.is_malformed() => {
                warn!(path = %self.path.display(), error = %e, request_id = id, "queue unreadable, nothing removed");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let before = entries.len();
        let remaining: Vec<Value> = entries
            .into_iter()
            .filter(|entry| entry_id(entry) != Some(id))
            .collect();
        if remaining.len() == before {
            debug!(request_id = id, "no queued item matched");
            return Ok(false);
        }

        self.write_entries(&remaining)?;
        info!(request_id = id, remaining = remaining.len(), "removed item from queue");
        Ok(true)
    }

    /// Producer path: read the existing document, push `item`, write it back.
    ///
    /// A corrupt document is copied to `<file>.corrupt` before the queue
    /// restarts, so an append never silently discards data.
    pub fn append(&self, item: QueueItem) -> Result<(), StoreError> {
        let _guard = self.guard.lock();
        let _lock = FileLock::acquire(&self.lock_path, LockMode::Exclusive)?;

        let mut entries = match self.read_document() {
            Ok(entries) => entries,
            Err(e) if e.is_malformed() => {
                let backup = corrupt_path_for(&self.path);
                fs::copy(&self.path, &backup).map_err(|e| StoreError::io(&backup, e))?;
                warn!(
                    path = %self.path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "queue document corrupt, moved aside"
                );
                Vec::new()
            }
            Err(e) => return Err(e),
        };

        let request_id = item.request_id.clone();
        entries.push(serde_json::to_value(&item)?);
        self.write_entries(&entries)?;
        info!(request_id = %request_id, depth = entries.len(), "appended item to queue");
        Ok(())
    }

    /// Raw records in file order, each kept exactly as stored.
    fn read_document(&self) -> Result<Vec<Value>, StoreError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        parse_document(&contents).map_err(|reason| StoreError::Malformed {
            path: self.path.clone(),
            reason,
        })
    }

    fn decode(&self, entries: Vec<Value>) -> Vec<QueueItem> {
        entries
            .into_iter()
            .enumerate()
            .filter_map(|(index, entry)| {
                let request_id = entry_id(&entry).map(str::to_owned);
                match serde_json::from_value(entry) {
                    Ok(item) => Some(item),
                    Err(e) => {
                        warn!(
                            path = %self.path.display(),
                            index,
                            request_id = request_id.as_deref().unwrap_or("?"),
                            error = %e,
                            "skipping undecodable queue record"
                        );
                        None
                    }
                }
            })
            .collect()
    }

    fn write_document(&self, items: &[QueueItem]) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(items)?;
        atomic_write(&self.path, &contents)
    }

    fn write_entries(&self, entries: &[Value]) -> Result<(), StoreError> {
        let contents = serde_json::to_string_pretty(entries)?;
        atomic_write(&self.path, &contents)
    }
}

fn entry_id(entry: &Value) -> Option<&str> {
    entry.get("request_id").and_then(Value::as_str)
}

/// Accepts a JSON array of records, or a single record object from the
/// older one-record-per-file format.
fn parse_document(contents: &str) -> Result<Vec<Value>, String> {
    let value: Value = serde_json::from_str(contents).map_err(|e| e.to_string())?;
    match value {
        Value::Array(entries) => Ok(entries),
        Value::Object(_) => Ok(vec![value]),
        other => Err(format!("expected array or object, found {}", json_type(&other))),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
