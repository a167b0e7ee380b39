//! Embedded log-structured store backed by `sled`.

use crate::{empty_range, Access, Backend, Batch, Database, Error, KvIterator};
use std::{ops::Bound, path::Path};
use tracing::debug;

/// A [Database] stored in a `sled` directory.
///
/// `sled` has no native read-only mode, so write rejection is enforced here. The directory
/// lock is released once the last handle is dropped.
pub struct SledDb {
    db: sled::Db,
    access: Access,
}

impl SledDb {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path, read_only: bool) -> Result<Self, Error> {
        let db = sled::Config::new().path(path).open()?;
        debug!(path = %path.display(), read_only, "opened sled store");
        Ok(Self {
            db,
            access: Access::new(read_only),
        })
    }

    fn range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let lower = start.map_or(Bound::Unbounded, |s| Bound::Included(s.to_vec()));
        let upper = end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.to_vec()));
        (lower, upper)
    }
}

impl Database for SledDb {
    fn backend(&self) -> Backend {
        Backend::Sled
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.access.read()?;
        Ok(self.db.get(key)?.map(|v| v.to_vec()))
    }

    fn has(&self, key: &[u8]) -> Result<bool, Error> {
        self.access.read()?;
        Ok(self.db.contains_key(key)?)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.access.write()?;
        self.db.insert(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.access.write()?;
        self.db.remove(key)?;
        Ok(())
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<KvIterator<'_>, Error> {
        self.access.read()?;
        if empty_range(start, end) {
            return Ok(Box::new(std::iter::empty()));
        }
        let iter = self.db.range(self.range(start, end));
        Ok(Box::new(iter.map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(Error::from)
        })))
    }

    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIterator<'_>, Error> {
        self.access.read()?;
        if empty_range(start, end) {
            return Ok(Box::new(std::iter::empty()));
        }
        let iter = self.db.range(self.range(start, end)).rev();
        Ok(Box::new(iter.map(|item| {
            item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                .map_err(Error::from)
        })))
    }

    fn new_batch(&self) -> Box<dyn Batch + '_> {
        Box::new(SledBatch {
            db: self,
            batch: sled::Batch::default(),
            len: 0,
        })
    }

    fn flush(&self) -> Result<(), Error> {
        self.access.read()?;
        self.db.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        self.access.read()?;
        self.db.flush()?;
        self.access.close();
        Ok(())
    }
}

struct SledBatch<'a> {
    db: &'a SledDb,
    batch: sled::Batch,
    len: usize,
}

impl Batch for SledBatch<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.batch.insert(key, value);
        self.len += 1;
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.batch.remove(key);
        self.len += 1;
        Ok(())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn write(&mut self) -> Result<(), Error> {
        self.db.access.write()?;
        let batch = std::mem::take(&mut self.batch);
        self.len = 0;
        self.db.db.apply_batch(batch)?;
        Ok(())
    }
}
