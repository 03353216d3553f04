//! Bookkeeping for linearizable reads (the ReadIndex protocol).
//!
//! A read is pegged to the commit index observed at registration. It becomes
//! servable once a majority heartbeat round has re-confirmed leadership and
//! the applier has caught up to the pegged index; the caller then reads the
//! state machine directly, off the log write path.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::types::{LogIndex, MetaError, NodeId};

/// A read pegged to a commit index, waiting for confirmation.
#[derive(Clone, Debug)]
pub struct PendingRead {
    pub id: u64,
    /// Commit index at registration; the applier must reach this.
    pub read_index: LogIndex,
    /// Peers that acked the confirmation heartbeat.
    pub confirmations: HashSet<NodeId>,
    /// Total cluster size including self.
    pub cluster_size: usize,
}

/// Where a pending read currently stands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadStatus {
    /// Leadership confirmed and the state machine has caught up.
    Ready,
    /// Still collecting heartbeat acks.
    WaitingForQuorum,
    /// Quorum confirmed, applier still behind the pegged index.
    WaitingForApply,
}

/// Tracks pending reads for the node runtime.
pub struct ReadIndexTracker {
    next_id: AtomicU64,
    pending: RwLock<HashMap<u64, PendingRead>>,
}

impl ReadIndexTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a read pegged at `read_index` and returns its id.
    pub fn register(&self, read_index: LogIndex, cluster_size: usize) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let read = PendingRead {
            id,
            read_index,
            confirmations: HashSet::new(),
            cluster_size,
        };
        self.pending
            .write()
            .expect("lock poisoned")
            .insert(id, read);
        id
    }

    /// Records a heartbeat ack from `from` for the given read.
    pub fn confirm(&self, id: u64, from: NodeId) -> Result<(), MetaError> {
        let mut pending = self.pending.write().expect("lock poisoned");
        let read = pending
            .get_mut(&id)
            .ok_or_else(|| MetaError::Kv(format!("pending read {} not found", id)))?;
        read.confirmations.insert(from);
        Ok(())
    }

    /// Checks whether the read is servable given the applier's position.
    /// The leader's own ack counts toward quorum.
    pub fn status(&self, id: u64, last_applied: LogIndex) -> Result<ReadStatus, MetaError> {
        let pending = self.pending.read().expect("lock poisoned");
        let read = pending
            .get(&id)
            .ok_or_else(|| MetaError::Kv(format!("pending read {} not found", id)))?;

        let quorum = read.cluster_size / 2 + 1;
        if read.confirmations.len() + 1 < quorum {
            return Ok(ReadStatus::WaitingForQuorum);
        }
        if last_applied < read.read_index {
            return Ok(ReadStatus::WaitingForApply);
        }
        Ok(ReadStatus::Ready)
    }

    /// Drops a finished (or abandoned) read.
    pub fn complete(&self, id: u64) -> Option<PendingRead> {
        self.pending.write().expect("lock poisoned").remove(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.read().expect("lock poisoned").len()
    }
}

impl Default for ReadIndexTracker {
    fn default() -> Self {
        Self::new()
    }
}
