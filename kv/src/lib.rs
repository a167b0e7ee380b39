//! Range-iterable key-value stores over pluggable backends.
//!
//! [Database] is the single interface the migration, patch, and finality components use to
//! talk to storage. Three backends implement it:
//!
//! * [Backend::MemDb]: an ordered in-memory map, used for tests and ephemeral stores.
//! * [Backend::Sled]: an embedded log-structured store (`sled`).
//! * [Backend::RocksDb]: RocksDB, available when the crate is built with the `rocksdb` feature.
//!
//! # Iteration
//!
//! [Database::iterator] and [Database::reverse_iterator] take an inclusive lower bound and an
//! exclusive upper bound (`None` means unbounded on that side). Every item is an owned
//! `(key, value)` pair, so callers may hold onto them after advancing.
//!
//! # Batches
//!
//! Writes staged in a [Batch] are applied atomically by [Batch::write]: either every staged
//! operation becomes visible or none does. A batch may be reused after it has been written.
//!
//! # On-disk layout
//!
//! Opening a directory that was created by a different engine fails with
//! [Error::BackendMismatch] instead of silently creating a second store on top of it (see
//! [detect]).
//!
//! # Example
//!
//! ```rust
//! use cronos_kv::{open, Backend, Config};
//!
//! let db = open(&Config::memory()).unwrap();
//! db.set(b"H:1", b"meta").unwrap();
//!
//! let mut batch = db.new_batch();
//! batch.set(b"H:2", b"meta").unwrap();
//! batch.write().unwrap();
//!
//! let keys: Vec<_> = db
//!     .iterator(Some(b"H:"), Some(b"H;"))
//!     .unwrap()
//!     .map(|r| r.unwrap().0)
//!     .collect();
//! assert_eq!(keys, vec![b"H:1".to_vec(), b"H:2".to_vec()]);
//! assert_eq!(db.backend(), Backend::MemDb);
//! ```

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use thiserror::Error;

pub mod detect;
mod memory;
#[cfg(feature = "rocksdb")]
mod rocks;
mod sleddb;

pub use memory::MemDb;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksDb;
pub use sleddb::SledDb;

/// Errors that can occur when interacting with a [Database].
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[cfg(feature = "rocksdb")]
    #[error("rocksdb error: {0}")]
    RocksDb(#[from] rocksdb::Error),
    #[error("backend mismatch at {path}: requested {requested}, found {found} layout")]
    BackendMismatch {
        path: PathBuf,
        requested: Backend,
        found: &'static str,
    },
    #[error("unsupported backend: {0}")]
    UnsupportedBackend(String),
    #[error("database does not exist: {0}")]
    NotFound(PathBuf),
    #[error("database opened read-only")]
    ReadOnly,
    #[error("database closed")]
    Closed,
}

/// A storage engine that can back a [Database].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Backend {
    MemDb,
    Sled,
    RocksDb,
}

impl Backend {
    /// Returns true if the backend persists data to a directory.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, Backend::MemDb)
    }

    /// Returns true if support for the backend was compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::MemDb | Backend::Sled => true,
            Backend::RocksDb => cfg!(feature = "rocksdb"),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Backend::MemDb => "memdb",
            Backend::Sled => "sled",
            Backend::RocksDb => "rocksdb",
        };
        f.write_str(name)
    }
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memdb" | "memory" => Ok(Backend::MemDb),
            "sled" | "leveldb" | "goleveldb" => Ok(Backend::Sled),
            "rocksdb" => Ok(Backend::RocksDb),
            other => Err(Error::UnsupportedBackend(other.to_string())),
        }
    }
}

/// An owned key-value pair yielded by iterators.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// Iterator over a key range.
pub type KvIterator<'a> = Box<dyn Iterator<Item = Result<KvPair, Error>> + 'a>;

/// An ordered key-value store.
pub trait Database: Send + Sync {
    /// The engine backing this store.
    fn backend(&self) -> Backend;

    /// Get the value stored at `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Returns true if `key` is present.
    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        Ok(self.get(key)?.is_some())
    }

    /// Store `value` at `key`.
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Remove `key` (a no-op if absent).
    fn delete(&self, key: &[u8]) -> Result<(), Error>;

    /// Iterate over `[start, end)` in ascending key order.
    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<KvIterator<'_>, Error>;

    /// Iterate over `[start, end)` in descending key order.
    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIterator<'_>, Error>;

    /// Create an empty write batch.
    fn new_batch(&self) -> Box<dyn Batch + '_>;

    /// Persist any buffered writes to stable storage.
    fn flush(&self) -> Result<(), Error>;

    /// Flush and reject all further operations.
    fn close(&self) -> Result<(), Error>;
}

/// A set of writes applied atomically.
pub trait Batch {
    /// Stage a write of `value` at `key`.
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Stage the removal of `key`.
    fn delete(&mut self, key: &[u8]) -> Result<(), Error>;

    /// Number of staged operations.
    fn len(&self) -> usize;

    /// Returns true if nothing is staged.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically apply all staged operations and reset the batch.
    fn write(&mut self) -> Result<(), Error>;
}

/// Configuration for [open].
#[derive(Clone, Debug)]
pub struct Config {
    /// Engine to open.
    pub backend: Backend,

    /// Directory holding the store (ignored by [Backend::MemDb]).
    pub path: PathBuf,

    /// Reject all writes.
    pub read_only: bool,

    /// Create the directory if it does not exist.
    pub create_if_missing: bool,
}

impl Config {
    /// An ephemeral in-memory store.
    pub fn memory() -> Self {
        Self {
            backend: Backend::MemDb,
            path: PathBuf::new(),
            read_only: false,
            create_if_missing: true,
        }
    }

    /// Open an existing store for reading only.
    pub fn read_only(backend: Backend, path: impl AsRef<Path>) -> Self {
        Self {
            backend,
            path: path.as_ref().to_path_buf(),
            read_only: true,
            create_if_missing: false,
        }
    }

    /// Open a store for reading and writing, creating it if absent.
    pub fn read_write(backend: Backend, path: impl AsRef<Path>) -> Self {
        Self {
            backend,
            path: path.as_ref().to_path_buf(),
            read_only: false,
            create_if_missing: true,
        }
    }

    /// Open an existing store for reading and writing (fails if absent).
    pub fn existing(backend: Backend, path: impl AsRef<Path>) -> Self {
        Self {
            backend,
            path: path.as_ref().to_path_buf(),
            read_only: false,
            create_if_missing: false,
        }
    }
}

/// Open a [Database] as described by `cfg`.
pub fn open(cfg: &Config) -> Result<Arc<dyn Database>, Error> {
    if !cfg.backend.is_available() {
        return Err(Error::UnsupportedBackend(format!(
            "{} support not compiled in",
            cfg.backend
        )));
    }
    if !cfg.backend.is_persistent() {
        return Ok(Arc::new(MemDb::new(cfg.read_only)));
    }

    // Prepare the directory
    if !cfg.path.exists() {
        if !cfg.create_if_missing {
            return Err(Error::NotFound(cfg.path.clone()));
        }
        std::fs::create_dir_all(&cfg.path)?;
    }
    detect::ensure_compatible(&cfg.path, cfg.backend)?;

    match cfg.backend {
        Backend::Sled => Ok(Arc::new(SledDb::open(&cfg.path, cfg.read_only)?)),
        #[cfg(feature = "rocksdb")]
        Backend::RocksDb => Ok(Arc::new(RocksDb::open(&cfg.path, cfg.read_only)?)),
        other => Err(Error::UnsupportedBackend(other.to_string())),
    }
}

/// Tracks whether a store accepts reads and writes.
#[derive(Debug, Default)]
pub(crate) struct Access {
    read_only: bool,
    closed: AtomicBool,
}

impl Access {
    pub(crate) fn new(read_only: bool) -> Self {
        Self {
            read_only,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn read(&self) -> Result<(), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn write(&self) -> Result<(), Error> {
        self.read()?;
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// Returns true if `[start, end)` cannot contain any key.
pub(crate) fn empty_range(start: Option<&[u8]>, end: Option<&[u8]>) -> bool {
    matches!((start, end), (Some(s), Some(e)) if s >= e)
}
