//! Rocksdb facade.
//!
//! The replication layer treats the store as a unit it can open, close,
//! wipe and checkpoint. `close()` is idempotent and the facade can be
//! reopened at the same state directory afterwards, which is exactly what
//! the snapshot-load path does.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rocksdb::checkpoint::Checkpoint;
use rocksdb::{IteratorMode, Options, WriteBatch, DB};
use thiserror::Error;

/// Errors surfaced by the store facade.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store engine error: {0}")]
    Engine(String),

    #[error("Store is closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Collection already exists: {0}")]
    CollectionExists(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(err: rocksdb::Error) -> Self {
        StoreError::Engine(err.to_string())
    }
}

type Result<T> = std::result::Result<T, StoreError>;

/// Facade over the embedded key-value store.
///
/// The handle is shared; the inner database is swapped atomically on
/// open/close so readers racing a close observe [`StoreError::Closed`]
/// rather than a torn handle.
pub struct Store {
    state_dir: PathBuf,
    db: RwLock<Option<Arc<DB>>>,
}

impl Store {
    /// Create a facade bound to `state_dir` without opening the database.
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            db: RwLock::new(None),
        }
    }

    /// Path of the on-disk state directory.
    pub fn state_dir_path(&self) -> &Path {
        &self.state_dir
    }

    /// Open the database, creating the state directory if needed.
    /// Re-opening an already open store is a no-op.
    pub fn open(&self) -> Result<()> {
        let mut guard = self.db.write();
        if guard.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.state_dir)?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &self.state_dir)?;
        *guard = Some(Arc::new(db));

        log::info!("Store opened at {}", self.state_dir.display());
        Ok(())
    }

    /// Close the database. Idempotent; the facade can be reopened later.
    pub fn close(&self) {
        let mut guard = self.db.write();
        if guard.take().is_some() {
            log::info!("Store closed at {}", self.state_dir.display());
        }
    }

    /// Whether the database is currently open.
    pub fn is_open(&self) -> bool {
        self.db.read().is_some()
    }

    /// Remove the state directory entirely. The store must be closed first.
    pub fn delete_state_dir(&self) -> Result<()> {
        if self.is_open() {
            self.close();
        }
        if self.state_dir.exists() {
            std::fs::remove_dir_all(&self.state_dir)?;
        }
        Ok(())
    }

    fn handle(&self) -> Result<Arc<DB>> {
        self.db.read().clone().ok_or(StoreError::Closed)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.handle()?.get(key)?)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        Ok(self.handle()?.put(key, value)?)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        Ok(self.handle()?.delete(key)?)
    }

    /// Apply a batch of puts atomically.
    pub fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let db = self.handle()?;
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put(key, value);
        }
        Ok(db.write(batch)?)
    }

    /// Collect all `(key, value)` pairs whose key starts with `prefix`.
    pub fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let db = self.handle()?;
        let mut out = Vec::new();

        let iter = db.iterator(IteratorMode::From(prefix, rocksdb::Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_vec(), value.to_vec()));
        }

        Ok(out)
    }

    /// Delete every key with the given prefix. Returns the number removed.
    pub fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let db = self.handle()?;
        let keys: Vec<Vec<u8>> = self
            .scan_prefix(prefix)?
            .into_iter()
            .map(|(k, _)| k)
            .collect();

        let mut batch = WriteBatch::default();
        for key in &keys {
            batch.delete(key);
        }
        db.write(batch)?;
        Ok(keys.len())
    }

    /// Produce a point-in-time checkpoint of the store at `target_dir`.
    ///
    /// Rocksdb hard-links immutable files into the target when the
    /// filesystem allows it and copies otherwise, so the result is a
    /// consistent snapshot regardless of concurrent writes. The target
    /// directory must not already exist.
    pub fn checkpoint(&self, target_dir: &Path) -> Result<()> {
        let db = self.handle()?;
        if let Some(parent) = target_dir.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let checkpoint = Checkpoint::new(&db)?;
        checkpoint.create_checkpoint(target_dir)?;

        log::info!("Checkpoint created at {}", target_dir.display());
        Ok(())
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("state_dir", &self.state_dir)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir) -> Store {
        let store = Store::new(dir.path().join("state"));
        store.open().unwrap();
        store
    }

    #[test]
    fn put_get_delete() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.put(b"k1", b"v1").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), Some(b"v1".to_vec()));

        store.delete(b"k1").unwrap();
        assert_eq!(store.get(b"k1").unwrap(), None);
    }

    #[test]
    fn close_is_idempotent_and_reopenable() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.put(b"k", b"v").unwrap();
        store.close();
        store.close();
        assert!(!store.is_open());
        assert!(matches!(store.get(b"k"), Err(StoreError::Closed)));

        store.open().unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn scan_prefix_stops_at_boundary() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);

        store.put(b"a/1", b"1").unwrap();
        store.put(b"a/2", b"2").unwrap();
        store.put(b"b/1", b"3").unwrap();

        let rows = store.scan_prefix(b"a/").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"a/1".to_vec());
    }

    #[test]
    fn checkpoint_is_openable_copy() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.put(b"k", b"v").unwrap();

        let target = dir.path().join("checkpoint");
        store.checkpoint(&target).unwrap();

        let copy = Store::new(&target);
        copy.open().unwrap();
        assert_eq!(copy.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn delete_state_dir_removes_files() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.put(b"k", b"v").unwrap();

        store.delete_state_dir().unwrap();
        assert!(!store.state_dir_path().exists());

        store.open().unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
    }
}
