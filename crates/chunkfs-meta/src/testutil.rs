//! Shared helpers for this crate's unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use crate::apply::StateMachine;
use crate::kvstore::MemoryKvStore;
use crate::rpc::{ChunkTransport, RpcError};
use crate::service::ConsensusHandle;
use crate::store::MetadataStore;
use crate::types::{
    ChunkGcEntry, ChunkId, Command, Inode, InodeId, LogIndex, MetaError, NodeId, ServerId,
};

/// A consensus handle that applies every proposal synchronously to a local
/// state machine. Lets the namespace logic be tested without the Raft
/// runtime; ordering and idempotence still go through the real apply path.
pub(crate) struct DirectConsensus {
    sm: StateMachine,
    index: AtomicU64,
    leader: std::sync::atomic::AtomicBool,
    /// Chunks released by applied teardowns, as the node would forward them.
    pub released: Mutex<Vec<ChunkGcEntry>>,
}

impl DirectConsensus {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            sm: StateMachine::new(store)
                .with_grace_period(std::time::Duration::from_secs(3600)),
            index: AtomicU64::new(0),
            leader: std::sync::atomic::AtomicBool::new(true),
            released: Mutex::new(Vec::new()),
        }
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

#[async_trait]
impl ConsensusHandle for DirectConsensus {
    async fn propose(&self, command: Command) -> Result<LogIndex, MetaError> {
        if !self.is_leader() {
            return Err(MetaError::NotLeader { leader_hint: None });
        }
        let outcome = self.sm.apply(&command)?;
        self.released.lock().unwrap().extend(outcome.released);
        Ok(LogIndex::new(self.index.fetch_add(1, Ordering::SeqCst) + 1))
    }

    async fn read_index(&self) -> Result<(), MetaError> {
        if !self.is_leader() {
            return Err(MetaError::NotLeader { leader_hint: None });
        }
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn leader_hint(&self) -> Option<NodeId> {
        None
    }
}

/// A fresh in-memory metadata store with the root directory in place.
pub(crate) fn bootstrap_store() -> Arc<MetadataStore> {
    let store = Arc::new(MetadataStore::open(Arc::new(MemoryKvStore::new())).unwrap());
    store
        .put_inode(&Inode::new_directory(InodeId::ROOT, InodeId::ROOT, "/", "root"))
        .unwrap();
    store
}

/// An in-memory chunk "network": per-server chunk maps, a log of deletes,
/// and a set of servers that refuse all requests.
pub(crate) struct FakeChunkNet {
    chunks: Mutex<HashMap<ServerId, HashMap<ChunkId, (Bytes, String)>>>,
    pub deleted: Mutex<Vec<(ServerId, ChunkId)>>,
    pub down: Mutex<HashSet<ServerId>>,
}

impl FakeChunkNet {
    pub fn new() -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            down: Mutex::new(HashSet::new()),
        }
    }

    pub fn seed(&self, server: &ServerId, chunk: &str, data: Bytes, checksum: &str) {
        self.chunks
            .lock()
            .unwrap()
            .entry(server.clone())
            .or_default()
            .insert(ChunkId::new(chunk), (data, checksum.to_string()));
    }

    pub fn holds(&self, server: &ServerId, chunk: &ChunkId) -> bool {
        self.chunks
            .lock()
            .unwrap()
            .get(server)
            .is_some_and(|m| m.contains_key(chunk))
    }

    fn check_up(&self, server: &ServerId) -> Result<(), RpcError> {
        if self.down.lock().unwrap().contains(server) {
            Err(RpcError::Unavailable(server.to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChunkTransport for FakeChunkNet {
    async fn upload_chunk(
        &self,
        server: &ServerId,
        chunk_id: &ChunkId,
        data: Bytes,
        checksum: &str,
        _replicas: &[ServerId],
    ) -> Result<(), RpcError> {
        self.check_up(server)?;
        self.chunks
            .lock()
            .unwrap()
            .entry(server.clone())
            .or_default()
            .insert(chunk_id.clone(), (data, checksum.to_string()));
        Ok(())
    }

    async fn download_chunk(
        &self,
        server: &ServerId,
        chunk_id: &ChunkId,
    ) -> Result<(Bytes, String), RpcError> {
        self.check_up(server)?;
        self.chunks
            .lock()
            .unwrap()
            .get(server)
            .and_then(|m| m.get(chunk_id))
            .cloned()
            .ok_or_else(|| RpcError::Rejected(format!("chunk {} not found", chunk_id)))
    }

    async fn delete_chunk(&self, server: &ServerId, chunk_id: &ChunkId) -> Result<(), RpcError> {
        self.check_up(server)?;
        if let Some(map) = self.chunks.lock().unwrap().get_mut(server) {
            map.remove(chunk_id);
        }
        self.deleted
            .lock()
            .unwrap()
            .push((server.clone(), chunk_id.clone()));
        Ok(())
    }

    async fn list_chunks(&self, server: &ServerId) -> Result<Vec<ChunkId>, RpcError> {
        self.check_up(server)?;
        Ok(self
            .chunks
            .lock()
            .unwrap()
            .get(server)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }
}
