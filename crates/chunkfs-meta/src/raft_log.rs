//! Persistent Raft hard state: current term, voted-for, and the log itself.
//!
//! Term and vote changes must hit disk before any message that depends on
//! them leaves the node, and appended entries must be durable before they are
//! acknowledged, otherwise a restarted node could vote twice in a term or
//! ack an entry it no longer has.

use std::sync::Arc;

use crate::kvstore::{BatchOp, KvStore};
use crate::types::{LogEntry, LogIndex, MetaError, NodeId, Term};

const KEY_TERM: &[u8] = b"raft/term";
const KEY_VOTED_FOR: &[u8] = b"raft/voted_for";
const PREFIX_LOG: &[u8] = b"raft/log/";

fn log_entry_key(index: LogIndex) -> Vec<u8> {
    // Big-endian index so lexicographic key order is log order.
    let mut key = PREFIX_LOG.to_vec();
    key.extend_from_slice(&index.as_u64().to_be_bytes());
    key
}

fn u64_from_be(bytes: &[u8]) -> Result<u64, MetaError> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| MetaError::Kv("malformed u64 value".to_string()))?;
    Ok(u64::from_be_bytes(arr))
}

/// Durable store for Raft state, layered on any [`KvStore`].
pub struct RaftLogStore {
    kv: Arc<dyn KvStore>,
}

impl RaftLogStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub fn save_term(&self, term: Term) -> Result<(), MetaError> {
        self.kv
            .put(KEY_TERM.to_vec(), term.as_u64().to_be_bytes().to_vec())
    }

    /// Loads the persisted term, defaulting to zero on a fresh store.
    pub fn load_term(&self) -> Result<Term, MetaError> {
        match self.kv.get(KEY_TERM)? {
            Some(bytes) => Ok(Term::new(u64_from_be(&bytes)?)),
            None => Ok(Term::ZERO),
        }
    }

    pub fn save_voted_for(&self, node: Option<NodeId>) -> Result<(), MetaError> {
        match node {
            Some(n) => self
                .kv
                .put(KEY_VOTED_FOR.to_vec(), n.as_u64().to_be_bytes().to_vec()),
            None => self.kv.delete(KEY_VOTED_FOR),
        }
    }

    pub fn load_voted_for(&self) -> Result<Option<NodeId>, MetaError> {
        match self.kv.get(KEY_VOTED_FOR)? {
            Some(bytes) => Ok(Some(NodeId::new(u64_from_be(&bytes)?))),
            None => Ok(None),
        }
    }

    /// Appends entries durably. Entries must carry their final indices.
    pub fn append_entries(&self, entries: &[LogEntry]) -> Result<(), MetaError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(entries.len());
        for entry in entries {
            let value =
                bincode::serialize(entry).map_err(|e| MetaError::Kv(e.to_string()))?;
            ops.push(BatchOp::Put {
                key: log_entry_key(entry.index),
                value,
            });
        }
        self.kv.write_batch(ops)
    }

    /// Removes every entry with index >= `from` (conflict truncation).
    pub fn truncate_from(&self, from: LogIndex) -> Result<(), MetaError> {
        let start = log_entry_key(from);
        let end = log_entry_key(LogIndex::new(u64::MAX));
        let pairs = self.kv.scan_range(&start, &end)?;
        let ops = pairs
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        self.kv.write_batch(ops)
    }

    /// Loads the whole log in index order.
    pub fn load_all(&self) -> Result<Vec<LogEntry>, MetaError> {
        let pairs = self.kv.scan_prefix(PREFIX_LOG)?;
        let mut entries = Vec::with_capacity(pairs.len());
        for (_, value) in pairs {
            let entry: LogEntry =
                bincode::deserialize(&value).map_err(|e| MetaError::Kv(e.to_string()))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}
