//! RocksDB-backed key/value storage.
//!
//! Write transactions map onto RocksDB write batches, which the engine
//! applies atomically. Rollback is dropping the batch unwritten.

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::path::Path;

use crate::info;
use crate::storage::kv::{Kv, StoreError};

/// Persistent [`Kv`] over a single RocksDB database.
pub struct RocksDbKv {
    db: DB,
}

impl RocksDbKv {
    /// Opens (or creates) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = DB::open(&opts, path).map_err(|e| StoreError::Backend(e.to_string()))?;
        info!("opened database at {}", path.display());
        Ok(Self { db })
    }
}

impl Kv for RocksDbKv {
    type WriteTx = WriteBatch;

    fn new_tx(&self) -> Self::WriteTx {
        WriteBatch::default()
    }

    fn put_with_tx(&self, tx: &mut Self::WriteTx, key: &[u8], value: &[u8]) {
        tx.put(key, value);
    }

    fn commit(&self, tx: Self::WriteTx) -> Result<(), StoreError> {
        self.db
            .write(tx)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn rollback(&self, tx: Self::WriteTx) {
        drop(tx);
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.db
            .get(key)
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item.map_err(|e| StoreError::Backend(e.to_string()))?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.into_vec(), value.into_vec()));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (RocksDbKv, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let kv = RocksDbKv::open(dir.path()).expect("open failed");
        (kv, dir)
    }

    #[test]
    fn commit_persists_within_handle() {
        let (kv, _dir) = open_temp();
        let mut tx = kv.new_tx();
        kv.put_with_tx(&mut tx, b"key", b"value");
        kv.commit(tx).unwrap();
        assert_eq!(kv.get(b"key").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn rollback_discards_batch() {
        let (kv, _dir) = open_temp();
        let mut tx = kv.new_tx();
        kv.put_with_tx(&mut tx, b"key", b"value");
        kv.rollback(tx);
        assert_eq!(kv.get(b"key").unwrap(), None);
    }

    #[test]
    fn iter_prefix_stops_at_boundary() {
        let (kv, _dir) = open_temp();
        kv.put(b"a:1", b"1").unwrap();
        kv.put(b"a:2", b"2").unwrap();
        kv.put(b"b:1", b"3").unwrap();

        let entries = kv.iter_prefix(b"a:").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(key, _)| key.starts_with(b"a:")));
    }

    #[test]
    fn reopen_sees_committed_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let kv = RocksDbKv::open(dir.path()).expect("open failed");
            kv.put(b"durable", b"yes").unwrap();
        }
        let kv = RocksDbKv::open(dir.path()).expect("reopen failed");
        assert_eq!(kv.get(b"durable").unwrap(), Some(b"yes".to_vec()));
    }
}
