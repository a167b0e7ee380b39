//! Durable record of which source chain blocks have been finalized.
//!
//! Each [FinalityInfo] is stored as JSON under `finality:<chain_id>:<height>`, with the height
//! zero-padded to 20 digits so that key order matches height order. Records are cached in
//! memory after the first read. The cache and every write are covered by one lock, so a read
//! that follows a save always observes it.

use crate::{
    types::{FinalityInfo, FinalityStoreStats},
    Error,
};
use cronos_kv::{Config, Database};
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, warn};

const KEY_PREFIX: &str = "finality:";

/// Key of the record for (`chain_id`, `height`).
pub fn finality_key(chain_id: &str, height: u64) -> Vec<u8> {
    format!("{KEY_PREFIX}{chain_id}:{height:020}").into_bytes()
}

/// `[start, end)` covering every record of `chain_id`.
fn chain_range(chain_id: &str) -> (Vec<u8>, Vec<u8>) {
    let start = format!("{KEY_PREFIX}{chain_id}:").into_bytes();
    let mut end = start.clone();
    // The prefix ends with ':' so incrementing the last byte cannot overflow
    if let Some(last) = end.last_mut() {
        *last += 1;
    }
    (start, end)
}

/// Finality records keyed by chain and height.
pub struct FinalityStore {
    db: Arc<dyn Database>,
    cache: RwLock<HashMap<(String, u64), FinalityInfo>>,
}

impl FinalityStore {
    /// Open the store described by `cfg`.
    pub fn open(cfg: &Config) -> Result<Self, Error> {
        let db = cronos_kv::open(cfg)?;
        debug!(backend = %db.backend(), path = %cfg.path.display(), "opened finality store");
        Ok(Self::new(db))
    }

    /// Wrap an already opened database.
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self {
            db,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self, chain_id: &str, height: u64) -> Result<Option<FinalityInfo>, Error> {
        match self.db.get(&finality_key(chain_id, height))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist `info`, replacing any earlier record for the same block.
    ///
    /// A finalized record is never replaced by a non-finalized one. Such a write is ignored.
    pub fn save(&self, info: &FinalityInfo) -> Result<(), Error> {
        let mut cache = self.cache.write();
        let cache_key = (info.chain_id.clone(), info.block_height);
        let existing = match cache.get(&cache_key) {
            Some(existing) => Some(existing.clone()),
            None => self.read(&info.chain_id, info.block_height)?,
        };
        if let Some(existing) = existing {
            if existing.finalized && !info.finalized {
                warn!(
                    chain_id = %info.chain_id,
                    height = info.block_height,
                    "ignoring write that would unfinalize block"
                );
                return Ok(());
            }
        }

        let value = serde_json::to_vec(info)?;
        self.db
            .set(&finality_key(&info.chain_id, info.block_height), &value)?;
        cache.insert(cache_key, info.clone());
        Ok(())
    }

    /// Record for (`chain_id`, `height`), if one was saved.
    pub fn get(&self, chain_id: &str, height: u64) -> Result<Option<FinalityInfo>, Error> {
        let cache_key = (chain_id.to_string(), height);
        if let Some(info) = self.cache.read().get(&cache_key) {
            return Ok(Some(info.clone()));
        }

        let mut cache = self.cache.write();
        if let Some(info) = cache.get(&cache_key) {
            return Ok(Some(info.clone()));
        }
        let info = self.read(chain_id, height)?;
        if let Some(info) = &info {
            cache.insert(cache_key, info.clone());
        }
        Ok(info)
    }

    /// Highest finalized height of `chain_id` (0 if none).
    pub fn latest_finalized(&self, chain_id: &str) -> Result<u64, Error> {
        let _guard = self.cache.read();
        let (start, end) = chain_range(chain_id);
        for item in self.db.reverse_iterator(Some(&start), Some(&end))? {
            let (_, value) = item?;
            let info: FinalityInfo = serde_json::from_slice(&value)?;
            if info.finalized {
                return Ok(info.block_height);
            }
        }
        Ok(0)
    }

    /// Up to `limit` non-finalized records of `chain_id`, lowest height first.
    pub fn list_pending(&self, chain_id: &str, limit: usize) -> Result<Vec<FinalityInfo>, Error> {
        let _guard = self.cache.read();
        let (start, end) = chain_range(chain_id);
        let mut pending = Vec::new();
        for item in self.db.iterator(Some(&start), Some(&end))? {
            let (_, value) = item?;
            let info: FinalityInfo = serde_json::from_slice(&value)?;
            if !info.finalized {
                pending.push(info);
            }
        }
        pending.sort_by_key(|info| info.block_height);
        pending.truncate(limit);
        Ok(pending)
    }

    /// Counts over every record of `chain_id`.
    pub fn stats(&self, chain_id: &str) -> Result<FinalityStoreStats, Error> {
        let _guard = self.cache.read();
        let (start, end) = chain_range(chain_id);
        let mut stats = FinalityStoreStats {
            chain_id: chain_id.to_string(),
            ..Default::default()
        };
        for item in self.db.iterator(Some(&start), Some(&end))? {
            let (_, value) = item?;
            let info: FinalityInfo = serde_json::from_slice(&value)?;
            stats.total_blocks += 1;
            stats.latest_block = stats.latest_block.max(info.block_height);
            if info.finalized {
                stats.finalized_blocks += 1;
                stats.latest_finalized = stats.latest_finalized.max(info.block_height);
            } else {
                stats.pending_blocks += 1;
            }
        }
        Ok(stats)
    }

    /// Drop the cache and close the backing database.
    pub fn close(&self) -> Result<(), Error> {
        let mut cache = self.cache.write();
        cache.clear();
        self.db.close()?;
        Ok(())
    }
}
