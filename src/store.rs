//! Durable key/value persistence.
//!
//! - [`FileStore`]: one JSON file per key, written atomically.
//! - [`MemoryStore`]: process-local map.
//! - [`BestEffortStore`]: wraps a backend and falls back to memory on the
//!   first failure, so persistence never breaks capture.
//!
//! The session manager and the event buffer write disjoint keys
//! ([`SESSION_KEY`], [`BATCH_KEY`]); last write wins.

use crate::error::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// Namespace prefix for every persisted key.
pub const KEY_PREFIX: &str = "trail.";
/// Serialized `Session` record.
pub const SESSION_KEY: &str = "trail.session";
/// Serialized unflushed `Batch` record.
pub const BATCH_KEY: &str = "trail.batch";

/// Storage contract. No transactional semantics.
pub trait PersistenceStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("memory store lock poisoned".into())
}

impl PersistenceStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FileStore
// ---------------------------------------------------------------------------

/// Stores each key as `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store rooted in the platform data directory (e.g. `~/.local/share/trail/`).
    pub fn in_data_dir() -> Option<Self> {
        dirs::data_dir().map(|p| Self::new(p.join("trail")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl PersistenceStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir)?;
        atomic_write(&self.path_for(key), value.as_bytes())?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write bytes to a file atomically: write to a temp file in the same
/// directory, then rename over the target. Prevents partial JSON on crash.
pub(crate) fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    use std::io::Write;

    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// BestEffortStore
// ---------------------------------------------------------------------------

/// Infallible facade over a [`PersistenceStore`].
///
/// The first backend failure switches the store into memory-only mode for
/// the rest of the process lifetime. Callers never see an error.
pub struct BestEffortStore {
    backend: Box<dyn PersistenceStore>,
    fallback: MemoryStore,
    degraded: AtomicBool,
}

impl BestEffortStore {
    pub fn new(backend: impl PersistenceStore + 'static) -> Self {
        Self {
            backend: Box::new(backend),
            fallback: MemoryStore::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryStore::new())
    }

    /// Whether storage has failed and persistence is memory-only.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn degrade(&self, op: &str, key: &str, error: &StoreError) {
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(%key, %op, error = %error, "storage unavailable, continuing in memory only");
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if !self.is_degraded() {
            match self.backend.get(key) {
                Ok(value) => return value,
                Err(e) => self.degrade("get", key, &e),
            }
        }
        self.fallback.get(key).ok().flatten()
    }

    pub fn set(&self, key: &str, value: &str) {
        if !self.is_degraded() {
            match self.backend.set(key, value) {
                Ok(()) => return,
                Err(e) => self.degrade("set", key, &e),
            }
        }
        let _ = self.fallback.set(key, value);
    }

    pub fn remove(&self, key: &str) {
        if !self.is_degraded() {
            match self.backend.remove(key) {
                Ok(()) => return,
                Err(e) => self.degrade("remove", key, &e),
            }
        }
        let _ = self.fallback.remove(key);
    }

    /// Read and decode a record. Missing or undecodable records read as `None`.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(%key, error = %e, "discarding undecodable record");
                None
            }
        }
    }

    pub fn set_json<T: Serialize>(&self, key: &str, value: &T) {
        match serde_json::to_string(value) {
            Ok(json) => self.set(key, &json),
            Err(e) => warn!(%key, error = %e, "failed to encode record"),
        }
    }
}

impl std::fmt::Debug for BestEffortStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BestEffortStore")
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}
