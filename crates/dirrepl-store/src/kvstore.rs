//! Ordered key-value store trait and its in-memory implementation.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::error::{Result, StoreError};

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Ordered byte-keyed store.
///
/// Every log of the changelog sits on one instance of this trait. Keys are
/// compared byte-lexicographically; ranges are half-open `[start, end)` unless a
/// method says otherwise.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<()>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<()>;

    /// Delete every key in `[start, end)`, returning how many were removed.
    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<usize>;

    /// Scan a range of keys `[start, end)`, returning pairs in sorted order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>>;

    /// First pair whose key lies strictly inside `(lower, +inf)` for an excluded
    /// bound, `[lower, +inf)` for an included one.
    fn seek(&self, lower: Bound<&[u8]>) -> Result<Option<KvPair>>;

    /// Last pair whose key lies below `upper` (inclusive or exclusive per the bound).
    fn seek_back(&self, upper: Bound<&[u8]>) -> Result<Option<KvPair>>;

    /// Number of keys currently stored.
    fn len(&self) -> Result<usize>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()>;

    /// Flush buffered state to durable storage.
    fn sync(&self) -> Result<()>;

    /// Remove every key.
    fn clear(&self) -> Result<()>;

    /// Lowest pair, if any.
    fn first(&self) -> Result<Option<KvPair>> {
        self.seek(Bound::Unbounded)
    }

    /// Highest pair, if any.
    fn last(&self) -> Result<Option<KvPair>> {
        self.seek_back(Bound::Unbounded)
    }

    /// Returns true when the store holds no key.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Returns true if the key exists.
    fn contains_key(&self, key: &[u8]) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// Smallest key strictly greater than `key` in byte-lexicographic order.
///
/// Turns an inclusive upper bound into the exclusive `end` expected by the range
/// methods.
pub fn key_successor(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Nothing survives a restart. Used directly in tests and as the read cache of
/// [`PersistentKvStore`](crate::PersistentKvStore).
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }

    /// Applies a batch without any logging; the caller owns durability.
    pub(crate) fn apply(&self, ops: Vec<BatchOp>) -> Result<()> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Keys in `[start, end)`, used to turn a range delete into point deletes.
    pub(crate) fn keys_in_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<Key>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, _)| k.clone())
            .collect())
    }

    /// Copy of every pair, in key order.
    pub(crate) fn snapshot(&self) -> Result<Vec<KvPair>> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Value>> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Key, value: Value) -> Result<()> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<()> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        data.remove(key);
        Ok(())
    }

    fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<usize> {
        let keys = self.keys_in_range(start, end)?;
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        let mut removed = 0;
        for key in keys {
            if data.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data
            .range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn seek(&self, lower: Bound<&[u8]>) -> Result<Option<KvPair>> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data
            .range::<[u8], _>((lower, Bound::Unbounded))
            .next()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn seek_back(&self, upper: Bound<&[u8]>) -> Result<Option<KvPair>> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data
            .range::<[u8], _>((Bound::Unbounded, upper))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone())))
    }

    fn len(&self) -> Result<usize> {
        let data = self.data.read().map_err(StoreError::poisoned)?;
        Ok(data.len())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<()> {
        self.apply(ops)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut data = self.data.write().map_err(StoreError::poisoned)?;
        data.clear();
        Ok(())
    }
}
