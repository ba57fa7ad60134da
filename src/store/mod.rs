//! Byte-keyed storage the ledger persists into.
//!
//! - [`KvStore`]: the backend interface (get/set/delete/prefix scan, batch apply)
//! - [`MemStore`]: ordered in-memory backend
//! - [`StoreBranch`]: write-set overlay over a read-only parent, committed atomically
//! - [`SqliteStore`]: durable backend used by the CLI
//!
//! Records are JSON. Key construction lives in [`keys`].

pub mod sqlite;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::types::{LedgerResult, StoreError};

pub use sqlite::SqliteStore;

/// A single buffered mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Set(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

/// Ordered byte-keyed storage.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Apply a write set. Backends with transactions override this to make it atomic.
    fn apply(&mut self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        for op in ops {
            match op {
                WriteOp::Set(key, value) => self.set(&key, &value)?,
                WriteOp::Delete(key) => self.delete(&key)?,
            }
        }
        Ok(())
    }
}

/// Smallest key greater than every key starting with `prefix`, if one exists.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Read and decode a JSON record.
pub fn read_record<T: DeserializeOwned>(
    store: &impl KvStore,
    key: &[u8],
) -> LedgerResult<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Encode and write a JSON record.
pub fn write_record<T: Serialize>(
    store: &mut impl KvStore,
    key: &[u8],
    value: &T,
) -> LedgerResult<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, &bytes)?;
    Ok(())
}

/// Ordered in-memory store.
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let upper = match prefix_end(prefix) {
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        Ok(self
            .entries
            .range::<[u8], _>((Bound::Included(prefix), upper.as_ref().map(|v| v.as_slice())))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Buffered writes over a read-only parent.
///
/// Reads see the buffered writes first. Nothing reaches the parent until the
/// caller takes the write set and applies it.
pub struct StoreBranch<'a, S: KvStore> {
    parent: &'a S,
    writes: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl<'a, S: KvStore> StoreBranch<'a, S> {
    pub fn new(parent: &'a S) -> Self {
        Self {
            parent,
            writes: BTreeMap::new(),
        }
    }

    /// Number of buffered mutations.
    pub fn pending(&self) -> usize {
        self.writes.len()
    }

    /// Consume the branch, yielding its mutations in key order.
    pub fn into_write_set(self) -> Vec<WriteOp> {
        self.writes
            .into_iter()
            .map(|(key, value)| match value {
                Some(value) => WriteOp::Set(key, value),
                None => WriteOp::Delete(key),
            })
            .collect()
    }
}

impl<S: KvStore> KvStore for StoreBranch<'_, S> {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self.writes.get(key) {
            Some(buffered) => Ok(buffered.clone()),
            None => self.parent.get(key),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.writes.insert(key.to_vec(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.writes.insert(key.to_vec(), None);
        Ok(())
    }

    fn prefix_scan(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.parent.prefix_scan(prefix)?.into_iter().collect();
        for (key, value) in self.writes.iter().filter(|(k, _)| k.starts_with(prefix)) {
            match value {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }
}

/// Key layout.
pub mod keys {
    use crate::types::{Address, PositionSide, SubaccountId};

    pub const SUBACCOUNT_PREFIX: &[u8] = b"SA/";
    pub const SAFETY_HEAP_PREFIX: &[u8] = b"SH/";
    pub const NEGATIVE_TNC_PREFIX: &[u8] = b"NT/";

    pub fn subaccount(id: &SubaccountId) -> Vec<u8> {
        let mut key = SUBACCOUNT_PREFIX.to_vec();
        key.extend(id.to_key());
        key
    }

    /// Prefix shared by every record of one heap.
    pub fn safety_heap(perpetual_id: u32, side: PositionSide) -> Vec<u8> {
        let mut key = SAFETY_HEAP_PREFIX.to_vec();
        key.extend_from_slice(&perpetual_id.to_be_bytes());
        key.push(side.as_byte());
        key
    }

    /// Forward map: heap slot -> subaccount id.
    pub fn safety_heap_slot(perpetual_id: u32, side: PositionSide, index: u32) -> Vec<u8> {
        let mut key = safety_heap(perpetual_id, side);
        key.extend_from_slice(b"/i/");
        key.extend_from_slice(&index.to_be_bytes());
        key
    }

    /// Reverse map: subaccount id -> heap slot.
    pub fn safety_heap_index(perpetual_id: u32, side: PositionSide, id: &SubaccountId) -> Vec<u8> {
        let mut key = safety_heap(perpetual_id, side);
        key.extend_from_slice(b"/s/");
        key.extend(id.to_key());
        key
    }

    pub fn safety_heap_len(perpetual_id: u32, side: PositionSide) -> Vec<u8> {
        let mut key = safety_heap(perpetual_id, side);
        key.extend_from_slice(b"/n");
        key
    }

    pub fn negative_tnc_seen_at(pool: &Address) -> Vec<u8> {
        let mut key = NEGATIVE_TNC_PREFIX.to_vec();
        key.extend_from_slice(pool.as_bytes());
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_end(&[0x01, 0xff]), Some(vec![0x02]));
        assert_eq!(prefix_end(&[0xff, 0xff]), None);
    }

    #[test]
    fn test_mem_store_prefix_scan_is_ordered() {
        let mut store = MemStore::new();
        store.set(b"b/2", b"2").unwrap();
        store.set(b"a/1", b"x").unwrap();
        store.set(b"b/1", b"1").unwrap();
        store.set(b"c", b"y").unwrap();

        let scanned = store.prefix_scan(b"b/").unwrap();
        assert_eq!(
            scanned,
            vec![
                (b"b/1".to_vec(), b"1".to_vec()),
                (b"b/2".to_vec(), b"2".to_vec())
            ]
        );
    }

    #[test]
    fn test_branch_overlays_parent_until_applied() {
        let mut store = MemStore::new();
        store.set(b"k/1", b"old").unwrap();
        store.set(b"k/2", b"gone").unwrap();

        let ops = {
            let mut branch = StoreBranch::new(&store);
            branch.set(b"k/1", b"new").unwrap();
            branch.delete(b"k/2").unwrap();
            branch.set(b"k/3", b"added").unwrap();

            assert_eq!(branch.get(b"k/1").unwrap(), Some(b"new".to_vec()));
            assert_eq!(branch.get(b"k/2").unwrap(), None);
            let keys: Vec<_> = branch
                .prefix_scan(b"k/")
                .unwrap()
                .into_iter()
                .map(|(k, _)| k)
                .collect();
            assert_eq!(keys, vec![b"k/1".to_vec(), b"k/3".to_vec()]);
            branch.into_write_set()
        };

        // Dropping the branch without applying leaves the parent untouched.
        assert_eq!(store.get(b"k/1").unwrap(), Some(b"old".to_vec()));

        store.apply(ops).unwrap();
        assert_eq!(store.get(b"k/1").unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.get(b"k/2").unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_records_roundtrip_as_json() {
        let mut store = MemStore::new();
        write_record(&mut store, b"r", &vec![1u32, 2, 3]).unwrap();
        let back: Option<Vec<u32>> = read_record(&store, b"r").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
        let missing: Option<Vec<u32>> = read_record(&store, b"missing").unwrap();
        assert!(missing.is_none());
    }
}
