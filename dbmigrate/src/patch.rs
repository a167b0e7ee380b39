//! Copy selected heights from a source database into an existing target.
//!
//! Only `blockstore` and `tx_index` can be patched: their keys embed the block height, which is
//! what selects the data to copy. Beyond the keys selected directly, patching writes the
//! companions that keep lookups in the target consistent:
//!
//! * `blockstore`: every `H:<height>` written is accompanied by `BH:<hash>`, with the hash read
//!   from the block meta.
//! * `tx_index`: every `tx.height/...` value is a transaction hash, whose primary record is copied
//!   along with any `ethereum_tx.ethereumTxHash/<hash>/<height>/<index>` keys for EVM transactions.
//!
//! There is no atomicity across batches. A patch interrupted midway leaves a partially patched
//! target and can be re-run over the same heights.

use crate::{
    codec::{decode_block_store_state, encode_block_store_state, extract_ethereum_tx_hash},
    db_path,
    display::{format_key, format_value},
    filter::{
        extract_block_hash, extract_height, extract_height_and_tx_index, get_blockstore_iterators,
        get_tx_index_iterator, increment_bytes, supports_height_filtering, BLOCK_HASH_PREFIX,
        BLOCK_STORE_STATE_KEY, ETH_TX_HASH_PREFIX,
    },
    Error, HeightRange, MigrationStats, DB_BLOCKSTORE, DEFAULT_BATCH_SIZE,
};
use cronos_kv::{open, Backend, Batch, Config, Database};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::{debug, info, warn};

/// How to treat a key that already exists in the target with a different value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictStrategy {
    /// Ask a [ConflictResolver] for each conflict.
    Ask,
    /// Overwrite the target.
    ReplaceAll,
    /// Leave the target untouched.
    SkipAll,
    /// Leave the target untouched (the target is authoritative).
    KeepTarget,
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConflictStrategy::Ask => "ask",
            ConflictStrategy::ReplaceAll => "replace-all",
            ConflictStrategy::SkipAll => "skip-all",
            ConflictStrategy::KeepTarget => "keep-target",
        };
        f.write_str(name)
    }
}

impl FromStr for ConflictStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "ask" => Ok(ConflictStrategy::Ask),
            "replace" | "replace-all" => Ok(ConflictStrategy::ReplaceAll),
            "skip" | "skip-all" => Ok(ConflictStrategy::SkipAll),
            "keep" | "keep-target" => Ok(ConflictStrategy::KeepTarget),
            other => Err(Error::ConfigInvalid(format!(
                "unknown conflict strategy: {other}"
            ))),
        }
    }
}

/// Answer to a single conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    Replace,
    Skip,
    /// Replace this key and every later conflict.
    ReplaceAll,
    /// Skip this key and every later conflict.
    SkipAll,
    /// Stop patching.
    Abort,
}

/// A key present in both databases with different values.
#[derive(Debug)]
pub struct Conflict<'a> {
    pub db_name: &'a str,
    pub key: &'a [u8],
    pub height: Option<u64>,
    pub existing: &'a [u8],
    pub incoming: &'a [u8],
}

/// Decides conflicts under [ConflictStrategy::Ask].
pub trait ConflictResolver {
    fn resolve(&mut self, conflict: &Conflict<'_>) -> Result<Resolution, Error>;
}

/// Options for [patch_database].
#[derive(Clone, Debug)]
pub struct PatchOptions {
    /// Home directory holding `data/{db_name}.db`.
    pub source_home: PathBuf,

    /// Existing `*.db` directory to patch.
    pub target_path: PathBuf,

    pub source_backend: Backend,
    pub target_backend: Backend,

    /// `blockstore` or `tx_index`.
    pub db_name: String,

    /// Heights to copy (must not be empty).
    pub height_range: HeightRange,

    /// Writes staged per batch (`0` selects [DEFAULT_BATCH_SIZE]).
    pub batch_size: usize,

    pub conflict_strategy: ConflictStrategy,

    /// Overwrite without reading the target first.
    pub skip_conflict_checks: bool,

    /// Count what would be written without writing anything.
    pub dry_run: bool,
}

impl PatchOptions {
    fn validate(&self) -> Result<PathBuf, Error> {
        if self.height_range.is_empty() {
            return Err(Error::ConfigInvalid(
                "height range is required for patching".into(),
            ));
        }
        self.height_range.validate()?;
        if !supports_height_filtering(&self.db_name) {
            return Err(Error::UnsupportedForPatch(self.db_name.clone()));
        }
        for backend in [self.source_backend, self.target_backend] {
            if !backend.is_persistent() {
                return Err(Error::ConfigInvalid(format!(
                    "backend {backend} cannot be used for an on-disk database"
                )));
            }
        }
        let source_path = db_path(&self.source_home, &self.db_name);
        if !source_path.exists() {
            return Err(Error::ConfigInvalid(format!(
                "source database does not exist: {}",
                source_path.display()
            )));
        }
        if !self.target_path.exists() {
            return Err(Error::ConfigInvalid(format!(
                "target database does not exist: {} (use database migrate to create one)",
                self.target_path.display()
            )));
        }
        Ok(source_path)
    }
}

/// Copy the heights selected by `opts` from the source into the target.
///
/// `resolver` is consulted only under [ConflictStrategy::Ask].
pub fn patch_database(
    opts: &PatchOptions,
    resolver: &mut dyn ConflictResolver,
) -> Result<MigrationStats, Error> {
    let source_path = opts.validate()?;
    let source = open(&Config::read_only(opts.source_backend, &source_path))?;
    let target = if opts.dry_run {
        open(&Config::read_only(opts.target_backend, &opts.target_path))?
    } else {
        open(&Config::existing(opts.target_backend, &opts.target_path))?
    };
    info!(
        database = %opts.db_name,
        source = %source_path.display(),
        source_backend = %opts.source_backend,
        target = %opts.target_path.display(),
        target_backend = %opts.target_backend,
        height_range = %opts.height_range,
        dry_run = opts.dry_run,
        "patching database"
    );

    let stats = MigrationStats::new();
    {
        let mut patcher = Patcher::new(opts, source.as_ref(), target.as_ref(), resolver, &stats);
        if opts.db_name == DB_BLOCKSTORE {
            patcher.count_blockstore()?;
            patcher.patch_blockstore()?;
        } else {
            patcher.count_tx_index()?;
            patcher.patch_tx_index()?;
        }
    }
    if opts.dry_run {
        info!(
            database = %opts.db_name,
            found = stats.processed_keys(),
            "dry run complete, no changes were made"
        );
    } else {
        target.flush()?;
    }
    source.close()?;
    target.close()?;
    if stats.skipped_keys() > 0 {
        info!(skipped = stats.skipped_keys(), "skipped conflicting keys");
    }
    stats.finish();
    Ok(stats)
}

/// Raise the height recorded in `BS:H` to `new_height`.
///
/// Returns true if the record was rewritten. Lower or equal heights (and a missing record) leave
/// the store untouched.
pub fn update_block_store_height(
    target_path: &Path,
    backend: Backend,
    new_height: u64,
) -> Result<bool, Error> {
    let db = open(&Config::existing(backend, target_path))?;
    let Some(value) = db.get(BLOCK_STORE_STATE_KEY)? else {
        warn!(path = %target_path.display(), "block store state not found");
        db.close()?;
        return Ok(false);
    };
    let mut state = decode_block_store_state(&value)?;
    let new_height = i64::try_from(new_height)
        .map_err(|_| Error::InvalidHeight(format!("height out of range: {new_height}")))?;
    if new_height <= state.height {
        debug!(current = state.height, new_height, "block store height already current");
        db.close()?;
        return Ok(false);
    }
    info!(
        base = state.base,
        from = state.height,
        to = new_height,
        "updating block store height"
    );
    state.height = new_height;
    db.set(BLOCK_STORE_STATE_KEY, &encode_block_store_state(&state))?;
    db.close()?;
    Ok(true)
}

/// Strategy used for companion keys: an open question is answered as replace.
fn companion_strategy(strategy: ConflictStrategy) -> ConflictStrategy {
    match strategy {
        ConflictStrategy::Ask => ConflictStrategy::ReplaceAll,
        other => other,
    }
}

struct Patcher<'a> {
    opts: &'a PatchOptions,
    source: &'a dyn Database,
    target: &'a dyn Database,
    resolver: &'a mut dyn ConflictResolver,
    stats: &'a MigrationStats,
    strategy: ConflictStrategy,
    batch: Option<Box<dyn Batch + 'a>>,
    staged: u64,
    batch_size: u64,
}

impl<'a> Patcher<'a> {
    fn new(
        opts: &'a PatchOptions,
        source: &'a dyn Database,
        target: &'a dyn Database,
        resolver: &'a mut dyn ConflictResolver,
        stats: &'a MigrationStats,
    ) -> Self {
        let batch = (!opts.dry_run).then(|| target.new_batch());
        let batch_size = if opts.batch_size == 0 {
            DEFAULT_BATCH_SIZE
        } else {
            opts.batch_size
        };
        Self {
            opts,
            source,
            target,
            resolver,
            stats,
            strategy: opts.conflict_strategy,
            batch,
            staged: 0,
            batch_size: batch_size as u64,
        }
    }

    fn count_blockstore(&self) -> Result<(), Error> {
        let mut total = 0;
        for (_, iter) in get_blockstore_iterators(self.source, &self.opts.height_range)? {
            for item in iter {
                item?;
                total += 1;
            }
        }
        self.stats.set_total(total);
        info!(database = %self.opts.db_name, total, "counted keys to patch");
        Ok(())
    }

    fn count_tx_index(&self) -> Result<(), Error> {
        let mut total = 0;
        for item in get_tx_index_iterator(self.source, &self.opts.height_range)? {
            item?;
            total += 1;
        }
        self.stats.set_total(total);
        info!(database = %self.opts.db_name, total, "counted keys to patch");
        Ok(())
    }

    /// Decide whether `key` should be written, consulting the strategy on conflict.
    fn should_write(
        &mut self,
        key: &[u8],
        value: &[u8],
        strategy: ConflictStrategy,
    ) -> Result<bool, Error> {
        if self.opts.skip_conflict_checks {
            return Ok(true);
        }
        let existing = match self.target.get(key)? {
            Some(existing) if existing != value => existing,
            _ => return Ok(true),
        };
        let write = match strategy {
            ConflictStrategy::ReplaceAll => true,
            ConflictStrategy::SkipAll | ConflictStrategy::KeepTarget => false,
            ConflictStrategy::Ask => {
                let conflict = Conflict {
                    db_name: &self.opts.db_name,
                    key,
                    height: extract_height(&self.opts.db_name, key),
                    existing: &existing,
                    incoming: value,
                };
                match self.resolver.resolve(&conflict)? {
                    Resolution::Replace => true,
                    Resolution::Skip => false,
                    Resolution::ReplaceAll => {
                        self.strategy = ConflictStrategy::ReplaceAll;
                        info!(strategy = %self.strategy, "conflict strategy updated");
                        true
                    }
                    Resolution::SkipAll => {
                        self.strategy = ConflictStrategy::SkipAll;
                        info!(strategy = %self.strategy, "conflict strategy updated");
                        false
                    }
                    Resolution::Abort => return Err(Error::Aborted),
                }
            }
        };
        if write {
            debug!(
                key = %format_key(key, 80),
                old = %format_value(&existing, 100),
                new = %format_value(value, 100),
                "replacing existing key"
            );
        } else {
            debug!(key = %format_key(key, 80), "skipping existing key");
            self.stats.add_skipped(1);
        }
        Ok(write)
    }

    /// Stage a write, committing the batch once it is full. Dry runs only count.
    fn stage(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        match self.batch.as_mut() {
            None => {
                debug!(key = %format_key(key, 80), value = %format_value(value, 100), "would patch key");
            }
            Some(batch) => {
                if let Err(err) = batch.set(key, value) {
                    self.stats.add_error();
                    warn!(key = %format_key(key, 80), error = %err, "failed to stage key");
                    return Ok(());
                }
            }
        }
        self.staged += 1;
        if self.staged >= self.batch_size {
            self.commit()?;
        }
        Ok(())
    }

    /// Stage a derived write that is not counted as a patched key.
    fn stage_companion(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        match self.batch.as_mut() {
            None => debug!(key = %format_key(key, 80), "would patch derived key"),
            Some(batch) => batch.set(key, value)?,
        }
        Ok(())
    }

    fn commit(&mut self) -> Result<(), Error> {
        if let Some(batch) = self.batch.as_mut() {
            if !batch.is_empty() {
                batch.write()?;
                debug!(staged = self.staged, "wrote batch");
            }
        }
        self.stats.add_processed(self.staged);
        self.staged = 0;
        Ok(())
    }

    fn patch_blockstore(&mut self) -> Result<(), Error> {
        let source = self.source;
        let range = self.opts.height_range.clone();
        for (prefix, iter) in get_blockstore_iterators(source, &range)? {
            debug!(prefix, "patching prefix");
            for item in iter {
                let (key, value) = item?;
                let strategy = self.strategy;
                if !self.should_write(&key, &value, strategy)? {
                    continue;
                }
                self.stage(&key, &value)?;
                if let Some(height) = extract_height(DB_BLOCKSTORE, &key) {
                    self.stats.observe_height(height);
                    if key.starts_with(b"H:") {
                        self.patch_block_hash(height, &value)?;
                    }
                }
            }
        }
        self.commit()?;
        info!(
            processed = self.stats.processed_keys(),
            highest = self.stats.highest_height(),
            "patched blockstore"
        );
        Ok(())
    }

    /// Write `BH:<hash>` for the block meta of `height`.
    fn patch_block_hash(&mut self, height: u64, meta: &[u8]) -> Result<(), Error> {
        let Some(hash) = extract_block_hash(meta) else {
            debug!(height, "no block hash in block meta");
            return Ok(());
        };
        let key = [BLOCK_HASH_PREFIX, hash.as_slice()].concat();
        let value = match self.source.get(&key)? {
            Some(value) => value,
            None => height.to_string().into_bytes(),
        };
        debug!(height, hash = %hex::encode(&hash), "patching block hash key");
        self.stage_companion(&key, &value)
    }

    fn patch_tx_index(&mut self) -> Result<(), Error> {
        let source = self.source;
        let range = self.opts.height_range.clone();

        // Step 1: height index, collecting transaction hashes
        let mut tx_hashes = BTreeSet::new();
        let mut eth_txs = BTreeMap::new();
        for item in get_tx_index_iterator(source, &range)? {
            let (key, value) = item?;
            let strategy = self.strategy;
            if !self.should_write(&key, &value, strategy)? {
                continue;
            }
            self.stage(&key, &value)?;
            if let Some(height) = extract_height(&self.opts.db_name, &key) {
                self.stats.observe_height(height);
            }
            if value.is_empty() {
                continue;
            }
            if let Some((height, index)) = extract_height_and_tx_index(&key) {
                if let Some(eth_hash) = self.ethereum_tx_hash(&value) {
                    eth_txs.insert(eth_hash, (height, index));
                }
            }
            tx_hashes.insert(value);
        }
        self.commit()?;
        info!(
            processed = self.stats.processed_keys(),
            tx_hashes = tx_hashes.len(),
            ethereum_tx_hashes = eth_txs.len(),
            "patched tx.height keys"
        );

        // Step 2: primary records keyed by transaction hash
        let strategy = companion_strategy(self.strategy);
        for tx_hash in &tx_hashes {
            let Some(record) = source.get(tx_hash)? else {
                debug!(tx_hash = %format_key(tx_hash, 80), "transaction record not found in source");
                continue;
            };
            if self.should_write(tx_hash, &record, strategy)? {
                self.stage(tx_hash, &record)?;
            }
        }
        self.commit()?;

        // Step 3: Ethereum hash index
        for (eth_hash, (height, index)) in &eth_txs {
            let prefix = format!("{ETH_TX_HASH_PREFIX}{eth_hash}/{height}/{index}").into_bytes();
            let upper = increment_bytes(&prefix);
            for item in source.iterator(Some(prefix.as_slice()), upper.as_deref())? {
                let (key, value) = item?;
                // Accept the exact key and its event-sequence variants, not longer indexes
                let rest = &key[prefix.len()..];
                if !rest.is_empty() && !rest.starts_with(b"$es$") {
                    continue;
                }
                if self.should_write(&key, &value, strategy)? {
                    self.stage(&key, &value)?;
                }
            }
        }
        self.commit()?;
        info!(processed = self.stats.processed_keys(), "patched tx_index");
        Ok(())
    }

    fn ethereum_tx_hash(&self, tx_hash: &[u8]) -> Option<String> {
        let record = match self.source.get(tx_hash) {
            Ok(Some(record)) => record,
            _ => return None,
        };
        match extract_ethereum_tx_hash(&record) {
            Ok(hash) => hash,
            Err(err) => {
                debug!(tx_hash = %format_key(tx_hash, 80), error = %err, "failed to read ethereum tx hash");
                None
            }
        }
    }
}
