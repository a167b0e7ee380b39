//! Migrate and patch CometBFT and application databases across storage backends.
//!
//! Two engines share the same height filter:
//!
//! * [migrate()] copies a whole logical database (optionally restricted to a [HeightRange]) into a
//!   fresh `{db}.db.migrate-temp` sibling directory, in batches, and can verify the copy
//!   afterwards.
//! * [patch_database()] copies selected heights of a `blockstore` or `tx_index` database into an
//!   existing target, resolving key conflicts with a [ConflictStrategy].
//!
//! # Key schemas
//!
//! Height-bearing keys are encoded as decimal strings (`H:<height>`, `P:<height>:<part>`,
//! `tx.height/<height>/...`), so lexicographic order is not numeric order. Every bounded scan
//! produced by [filter] is re-checked numerically before a key is accepted.
//!
//! # Example
//!
//! ```rust
//! use cronos_dbmigrate::parse_height_flag;
//!
//! let range = parse_height_flag("10000-20000").unwrap();
//! assert!(range.is_within_range(15000));
//! assert!(!range.is_within_range(150000));
//! assert_eq!(range.to_string(), "heights 10000 to 20000");
//! ```

use std::path::PathBuf;
use thiserror::Error;

pub mod codec;
pub mod display;
pub mod filter;
mod height;
mod migrate;
mod patch;
mod stats;

pub use height::{parse_height_flag, HeightRange};
pub use migrate::{migrate, temp_target_path, MigrateOptions};
pub use patch::{
    patch_database, update_block_store_height, Conflict, ConflictResolver, ConflictStrategy,
    PatchOptions, Resolution,
};
pub use stats::MigrationStats;

/// Name of the CometBFT block store database.
pub const DB_BLOCKSTORE: &str = "blockstore";

/// Name of the CometBFT transaction index database.
pub const DB_TX_INDEX: &str = "tx_index";

/// Name of the application state database.
pub const DB_APPLICATION: &str = "application";

/// Databases owned by CometBFT.
pub const COMETBFT_DATABASES: [&str; 4] = ["blockstore", "state", "tx_index", "evidence"];

/// Directory suffix of every database.
pub const DB_EXTENSION: &str = ".db";

/// Default number of writes staged per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Errors that can occur during migration or patching.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("database {0} does not support height-based patching (only blockstore and tx_index)")]
    UnsupportedForPatch(String),
    #[error("invalid height: {0}")]
    InvalidHeight(String),
    #[error("verification failed: {mismatches} mismatches (target left at {target})")]
    VerificationFailed { mismatches: u64, target: PathBuf },
    #[error("malformed record: {0}")]
    Malformed(String),
    #[error("aborted by user")]
    Aborted,
    #[error("kv error: {0}")]
    Kv(#[from] cronos_kv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Path of `{home}/data/{db}.db`.
pub fn db_path(home: &std::path::Path, db_name: &str) -> PathBuf {
    home.join("data").join(format!("{db_name}{DB_EXTENSION}"))
}

/// Parse a backend name accepted on the command line.
///
/// Path-based engines only: the in-memory backend cannot be migrated from or patched into.
pub fn parse_backend(name: &str) -> Result<cronos_kv::Backend, Error> {
    let backend: cronos_kv::Backend = name
        .parse()
        .map_err(|_| Error::ConfigInvalid(format!("unsupported backend: {name}")))?;
    if !backend.is_persistent() {
        return Err(Error::ConfigInvalid(format!(
            "backend {backend} cannot be used for an on-disk database"
        )));
    }
    if !backend.is_available() {
        return Err(Error::ConfigInvalid(format!(
            "{backend} support not compiled in"
        )));
    }
    Ok(backend)
}
