//! RocksDB-backed store.

use crate::{empty_range, Access, Backend, Batch, Database, Error, KvIterator};
use rocksdb::{DBWithThreadMode, IteratorMode, MultiThreaded, Options, ReadOptions, WriteBatch};
use std::path::Path;
use tracing::debug;

type Db = DBWithThreadMode<MultiThreaded>;

/// A [Database] stored in a RocksDB directory.
pub struct RocksDb {
    db: Db,
    access: Access,
    read_only: bool,
}

impl RocksDb {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path, read_only: bool) -> Result<Self, Error> {
        let mut opts = Options::default();
        opts.create_if_missing(!read_only);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = if read_only {
            Db::open_for_read_only(&opts, path, false)?
        } else {
            Db::open(&opts, path)?
        };
        debug!(path = %path.display(), read_only, "opened rocksdb store");
        Ok(Self {
            db,
            access: Access::new(read_only),
            read_only,
        })
    }

    fn read_options(start: Option<&[u8]>, end: Option<&[u8]>) -> ReadOptions {
        let mut opts = ReadOptions::default();
        if let Some(start) = start {
            opts.set_iterate_lower_bound(start.to_vec());
        }
        if let Some(end) = end {
            opts.set_iterate_upper_bound(end.to_vec());
        }
        opts
    }
}

impl Database for RocksDb {
    fn backend(&self) -> Backend {
        Backend::RocksDb
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.access.read()?;
        Ok(self.db.get(key)?)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.access.write()?;
        self.db.put(key, value)?;
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.access.write()?;
        self.db.delete(key)?;
        Ok(())
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<KvIterator<'_>, Error> {
        self.access.read()?;
        if empty_range(start, end) {
            return Ok(Box::new(std::iter::empty()));
        }
        let iter = self
            .db
            .iterator_opt(IteratorMode::Start, Self::read_options(start, end));
        Ok(Box::new(iter.map(|item| {
            item.map(|(k, v)| (k.into_vec(), v.into_vec()))
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
        let iter = self
            .db
            .iterator_opt(IteratorMode::End, Self::read_options(start, end));
        Ok(Box::new(iter.map(|item| {
            item.map(|(k, v)| (k.into_vec(), v.into_vec()))
                .map_err(Error::from)
        })))
    }

    fn new_batch(&self) -> Box<dyn Batch + '_> {
        Box::new(RocksBatch {
            db: self,
            batch: WriteBatch::default(),
        })
    }

    fn flush(&self) -> Result<(), Error> {
        self.access.read()?;
        if !self.read_only {
            self.db.flush()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        self.flush()?;
        self.access.close();
        Ok(())
    }
}

struct RocksBatch<'a> {
    db: &'a RocksDb,
    batch: WriteBatch,
}

impl Batch for RocksBatch<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.batch.put(key, value);
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.batch.delete(key);
        Ok(())
    }

    fn len(&self) -> usize {
        self.batch.len()
    }

    fn write(&mut self) -> Result<(), Error> {
        self.db.access.write()?;
        let batch = std::mem::take(&mut self.batch);
        self.db.db.write(batch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::conformance;

    #[test]
    fn test_rocksdb_conformance() {
        let dir = tempfile::tempdir().unwrap();
        let db = RocksDb::open(&dir.path().join("store.db"), false).unwrap();
        conformance::run(&db);
    }

    #[test]
    fn test_rocksdb_read_only_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");
        {
            let db = RocksDb::open(&path, false).unwrap();
            db.set(b"BS:H", b"{}").unwrap();
            db.close().unwrap();
        }
        let db = RocksDb::open(&path, true).unwrap();
        assert_eq!(db.get(b"BS:H").unwrap(), Some(b"{}".to_vec()));
        assert!(matches!(db.delete(b"BS:H"), Err(Error::ReadOnly)));
    }
}
