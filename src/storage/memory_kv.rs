//! In-memory key/value backend for tests.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::storage::kv::{Kv, StoreError};

/// BTreeMap-backed [`Kv`] with the same transactional surface as the
/// RocksDB backend. Ordered keys make prefix iteration trivial.
#[derive(Default)]
pub struct MemoryKv {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<Vec<u8>, Vec<u8>>> {
        self.map.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Kv for MemoryKv {
    type WriteTx = Vec<(Vec<u8>, Vec<u8>)>;

    fn new_tx(&self) -> Self::WriteTx {
        Vec::new()
    }

    fn put_with_tx(&self, tx: &mut Self::WriteTx, key: &[u8], value: &[u8]) {
        tx.push((key.to_vec(), value.to_vec()));
    }

    fn commit(&self, tx: Self::WriteTx) -> Result<(), StoreError> {
        let mut map = self.map.write().unwrap_or_else(|e| e.into_inner());
        for (key, value) in tx {
            map.insert(key, value);
        }
        Ok(())
    }

    fn rollback(&self, tx: Self::WriteTx) {
        drop(tx);
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.read().get(key).cloned())
    }

    fn iter_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        Ok(self
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
