//! Key-value persistence substrate for the metadata plane.
//!
//! The metadata keyspace (`inode:`, `children:`, `chunk:`, `chunk_ref:`,
//! `server:`, `upload:`) and the consensus log both sit on this trait, so the
//! backing store can be swapped without touching the state machine.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::RwLock;

use crate::types::MetaError;

/// A key-value pair returned by scans.
pub type KvPair = (Vec<u8>, Vec<u8>);

/// One operation in an atomic write batch.
pub enum BatchOp {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

/// Operations the metadata plane needs from its persistence substrate.
pub trait KvStore: Send + Sync {
    /// Returns the value for `key`, or None.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError>;

    /// Inserts or overwrites `key`.
    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError>;

    /// All pairs whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// All pairs with key in `[start, end)`, in key order.
    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Applies all operations atomically.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;
}

/// In-memory store backed by a BTreeMap. Used for tests and single-process
/// deployments; contents do not survive a restart.
pub struct MemoryKvStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let data = self.data.read().map_err(|e| MetaError::Kv(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(|e| MetaError::Kv(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(|e| MetaError::Kv(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(|e| MetaError::Kv(e.to_string()))?;
        let mut out = Vec::new();
        for (k, v) in data.range::<Vec<u8>, _>((Bound::Included(prefix.to_vec()), Bound::Unbounded)) {
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.clone(), v.clone()));
        }
        Ok(out)
    }

    fn scan_range(&self, start: &[u8], end: &[u8]) -> Result<Vec<KvPair>, MetaError> {
        let data = self.data.read().map_err(|e| MetaError::Kv(e.to_string()))?;
        let range = (
            Bound::Included(start.to_vec()),
            Bound::Excluded(end.to_vec()),
        );
        Ok(data
            .range::<Vec<u8>, _>(range)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut data = self.data.write().map_err(|e| MetaError::Kv(e.to_string()))?;
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let kv = MemoryKvStore::new();
        kv.put(b"a".to_vec(), b"1".to_vec()).unwrap();
        assert_eq!(kv.get(b"a").unwrap(), Some(b"1".to_vec()));

        kv.delete(b"a").unwrap();
        assert_eq!(kv.get(b"a").unwrap(), None);

        // deleting a missing key is fine
        kv.delete(b"a").unwrap();
    }

    #[test]
    fn test_scan_prefix_respects_boundaries() {
        let kv = MemoryKvStore::new();
        kv.put(b"children:1:a".to_vec(), b"10".to_vec()).unwrap();
        kv.put(b"children:1:b".to_vec(), b"11".to_vec()).unwrap();
        kv.put(b"children:12:a".to_vec(), b"12".to_vec()).unwrap();

        let pairs = kv.scan_prefix(b"children:1:").unwrap();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, b"children:1:a".to_vec());
        assert_eq!(pairs[1].0, b"children:1:b".to_vec());
    }

    #[test]
    fn test_scan_range_excludes_end() {
        let kv = MemoryKvStore::new();
        for i in 0u8..5 {
            kv.put(vec![b'k', i], vec![i]).unwrap();
        }
        let pairs = kv.scan_range(&[b'k', 1], &[b'k', 4]).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].1, vec![1]);
        assert_eq!(pairs[2].1, vec![3]);
    }

    #[test]
    fn test_write_batch_applies_all_ops() {
        let kv = MemoryKvStore::new();
        kv.put(b"old".to_vec(), b"x".to_vec()).unwrap();
        kv.write_batch(vec![
            BatchOp::Put {
                key: b"new".to_vec(),
                value: b"y".to_vec(),
            },
            BatchOp::Delete { key: b"old".to_vec() },
        ])
        .unwrap();
        assert_eq!(kv.get(b"new").unwrap(), Some(b"y".to_vec()));
        assert_eq!(kv.get(b"old").unwrap(), None);
    }
}
