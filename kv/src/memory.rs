//! Ordered in-memory store.

use crate::{empty_range, Access, Backend, Batch, Database, Error, KvIterator, KvPair};
use parking_lot::RwLock;
use std::{collections::BTreeMap, ops::Bound, sync::Arc};

type Map = BTreeMap<Vec<u8>, Vec<u8>>;

/// A [Database] held entirely in memory.
#[derive(Clone)]
pub struct MemDb {
    data: Arc<RwLock<Map>>,
    access: Arc<Access>,
}

impl Default for MemDb {
    fn default() -> Self {
        Self::new(false)
    }
}

impl MemDb {
    /// Create an empty store.
    pub fn new(read_only: bool) -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
            access: Arc::new(Access::new(read_only)),
        }
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn collect(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Vec<KvPair> {
        if empty_range(start, end) {
            return Vec::new();
        }
        let lower = start.map_or(Bound::Unbounded, |s| Bound::Included(s.to_vec()));
        let upper = end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.to_vec()));
        self.data
            .read()
            .range((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

impl Database for MemDb {
    fn backend(&self) -> Backend {
        Backend::MemDb
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        self.access.read()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.access.write()?;
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), Error> {
        self.access.write()?;
        self.data.write().remove(key);
        Ok(())
    }

    fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<KvIterator<'_>, Error> {
        self.access.read()?;
        Ok(Box::new(self.collect(start, end).into_iter().map(Ok)))
    }

    fn reverse_iterator(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<KvIterator<'_>, Error> {
        self.access.read()?;
        Ok(Box::new(self.collect(start, end).into_iter().rev().map(Ok)))
    }

    fn new_batch(&self) -> Box<dyn Batch + '_> {
        Box::new(MemBatch {
            db: self,
            ops: Vec::new(),
        })
    }

    fn flush(&self) -> Result<(), Error> {
        self.access.read()
    }

    fn close(&self) -> Result<(), Error> {
        self.access.close();
        Ok(())
    }
}

struct MemBatch<'a> {
    db: &'a MemDb,
    ops: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl Batch for MemBatch<'_> {
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.ops.push((key.to_vec(), Some(value.to_vec())));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.ops.push((key.to_vec(), None));
        Ok(())
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    fn write(&mut self) -> Result<(), Error> {
        self.db.access.write()?;

        // Apply every operation under a single lock
        let mut data = self.db.data.write();
        for (key, value) in self.ops.drain(..) {
            match value {
                Some(value) => {
                    data.insert(key, value);
                }
                None => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::conformance;

    #[test]
    fn test_memdb_conformance() {
        conformance::run(&MemDb::default());
    }

    #[test]
    fn test_memdb_read_only() {
        let db = MemDb::new(true);
        assert!(matches!(db.set(b"k", b"v"), Err(Error::ReadOnly)));
        let mut batch = db.new_batch();
        batch.set(b"k", b"v").unwrap();
        assert!(matches!(batch.write(), Err(Error::ReadOnly)));
        assert!(db.is_empty());
    }

    #[test]
    fn test_memdb_closed() {
        let db = MemDb::default();
        db.set(b"k", b"v").unwrap();
        db.close().unwrap();
        assert!(matches!(db.get(b"k"), Err(Error::Closed)));
    }
}
