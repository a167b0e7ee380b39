//! Identify which engine created an existing store directory.
//!
//! Each engine leaves a recognizable set of files behind:
//!
//! * `sled`: a `conf` file next to a `db` file.
//! * RocksDB: `OPTIONS-*`, `IDENTITY`, or `*.sst` files.
//! * LevelDB: `*.ldb` files, or a `CURRENT` manifest pointer without RocksDB's `OPTIONS-*`.
//!
//! An empty directory (or one holding files none of the above claim) is compatible with any
//! backend.

use crate::{Backend, Error};
use std::{fs, path::Path};

/// Directory layouts recognized by [detect].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    Empty,
    Sled,
    RocksDb,
    LevelDb,
    Unknown,
}

impl Layout {
    /// Short name used in error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Layout::Empty => "empty",
            Layout::Sled => "sled",
            Layout::RocksDb => "rocksdb",
            Layout::LevelDb => "leveldb",
            Layout::Unknown => "unknown",
        }
    }

    fn accepts(&self, backend: Backend) -> bool {
        match self {
            Layout::Empty | Layout::Unknown => true,
            Layout::Sled => backend == Backend::Sled,
            Layout::RocksDb => backend == Backend::RocksDb,
            Layout::LevelDb => false,
        }
    }
}

/// Inspect the files in `path` and classify the layout.
pub fn detect(path: &Path) -> Result<Layout, Error> {
    let mut names = Vec::new();
    for entry in fs::read_dir(path)? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    if names.is_empty() {
        return Ok(Layout::Empty);
    }

    let has = |name: &str| names.iter().any(|n| n == name);
    let options = names.iter().any(|n| n.starts_with("OPTIONS-"));
    if has("conf") && has("db") {
        return Ok(Layout::Sled);
    }
    if options || has("IDENTITY") || names.iter().any(|n| n.ends_with(".sst")) {
        return Ok(Layout::RocksDb);
    }
    if names.iter().any(|n| n.ends_with(".ldb")) || has("CURRENT") {
        return Ok(Layout::LevelDb);
    }
    Ok(Layout::Unknown)
}

/// Fail with [Error::BackendMismatch] if `path` holds a store written by another engine.
pub fn ensure_compatible(path: &Path, backend: Backend) -> Result<(), Error> {
    let layout = detect(path)?;
    if layout.accepts(backend) {
        return Ok(());
    }
    Err(Error::BackendMismatch {
        path: path.to_path_buf(),
        requested: backend,
        found: layout.name(),
    })
}
