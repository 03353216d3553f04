//! Typed accessors over the metadata keyspace.
//!
//! Layout (values are JSON-serialized records):
//!
//! ```text
//! inode:<id>                      -> Inode
//! children:<parent>:<name>        -> child inode id (decimal)
//! chunk:<inode>:<version>:<index> -> ChunkMeta
//! chunk_ref:<chunk_id>            -> reference count (decimal)
//! server:<id>                     -> ChunkServerInfo
//! upload:<id>                     -> UploadSession
//! meta/next_inode_id              -> allocator watermark (decimal)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::kvstore::{BatchOp, KvStore};
use crate::types::{
    ChunkId, ChunkMeta, ChunkServerInfo, Inode, InodeId, MetaError, ServerId, ServerStatus,
    Timestamp, UploadId, UploadSession,
};

const KEY_NEXT_INODE_ID: &[u8] = b"meta/next_inode_id";

fn inode_key(id: InodeId) -> Vec<u8> {
    format!("inode:{}", id.as_u64()).into_bytes()
}

fn child_key(parent: InodeId, name: &str) -> Vec<u8> {
    format!("children:{}:{}", parent.as_u64(), name).into_bytes()
}

fn children_prefix(parent: InodeId) -> Vec<u8> {
    format!("children:{}:", parent.as_u64()).into_bytes()
}

fn chunk_key(inode: InodeId, version: u64, index: u32) -> Vec<u8> {
    format!("chunk:{}:{}:{}", inode.as_u64(), version, index).into_bytes()
}

fn chunk_version_prefix(inode: InodeId, version: u64) -> Vec<u8> {
    format!("chunk:{}:{}:", inode.as_u64(), version).into_bytes()
}

fn chunk_ref_key(chunk_id: &ChunkId) -> Vec<u8> {
    format!("chunk_ref:{}", chunk_id).into_bytes()
}

fn server_key(id: &ServerId) -> Vec<u8> {
    format!("server:{}", id).into_bytes()
}

fn upload_key(id: &UploadId) -> Vec<u8> {
    format!("upload:{}", id).into_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, MetaError> {
    serde_json::to_vec(value).map_err(|e| MetaError::Kv(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MetaError> {
    serde_json::from_slice(bytes).map_err(|e| MetaError::Kv(e.to_string()))
}

fn decode_u64(bytes: &[u8]) -> Result<u64, MetaError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MetaError::Kv("malformed decimal value".to_string()))
}

/// The metadata plane's persisted state: namespace, chunk map, refcounts,
/// server registry, and upload sessions.
pub struct MetadataStore {
    kv: Arc<dyn KvStore>,
    next_inode_id: AtomicU64,
}

impl MetadataStore {
    /// Opens the store, loading the inode-id allocator watermark.
    /// Inode id 1 is reserved for the root, so allocation starts at 2.
    pub fn open(kv: Arc<dyn KvStore>) -> Result<Self, MetaError> {
        let next = match kv.get(KEY_NEXT_INODE_ID)? {
            Some(bytes) => decode_u64(&bytes)?,
            None => 2,
        };
        Ok(Self {
            kv,
            next_inode_id: AtomicU64::new(next),
        })
    }

    /// Allocates the next inode id and persists the watermark.
    pub fn allocate_inode_id(&self) -> Result<InodeId, MetaError> {
        let id = self.next_inode_id.fetch_add(1, Ordering::SeqCst);
        self.kv.put(
            KEY_NEXT_INODE_ID.to_vec(),
            (id + 1).to_string().into_bytes(),
        )?;
        Ok(InodeId::new(id))
    }

    /// Bumps the allocator past an id observed in an applied command, so a
    /// node that becomes leader after replaying the log cannot re-issue ids.
    pub fn note_inode_id(&self, id: InodeId) -> Result<(), MetaError> {
        let floor = id.as_u64() + 1;
        let prev = self.next_inode_id.fetch_max(floor, Ordering::SeqCst);
        if floor > prev {
            self.kv.put(
                KEY_NEXT_INODE_ID.to_vec(),
                floor.to_string().into_bytes(),
            )?;
        }
        Ok(())
    }

    // ── inodes ──────────────────────────────────────────────────────────

    pub fn get_inode(&self, id: InodeId) -> Result<Option<Inode>, MetaError> {
        match self.kv.get(&inode_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_inode(&self, inode: &Inode) -> Result<(), MetaError> {
        self.kv.put(inode_key(inode.id), encode(inode)?)
    }

    pub fn delete_inode(&self, id: InodeId) -> Result<(), MetaError> {
        self.kv.delete(&inode_key(id))
    }

    // ── directory edges ─────────────────────────────────────────────────

    pub fn add_child(&self, parent: InodeId, name: &str, child: InodeId) -> Result<(), MetaError> {
        self.kv
            .put(child_key(parent, name), child.as_u64().to_string().into_bytes())
    }

    pub fn remove_child(&self, parent: InodeId, name: &str) -> Result<(), MetaError> {
        self.kv.delete(&child_key(parent, name))
    }

    pub fn get_child(&self, parent: InodeId, name: &str) -> Result<Option<InodeId>, MetaError> {
        match self.kv.get(&child_key(parent, name))? {
            Some(bytes) => Ok(Some(InodeId::new(decode_u64(&bytes)?))),
            None => Ok(None),
        }
    }

    /// All edges under a directory as `(name, child_id)`, in name order.
    pub fn list_children(&self, parent: InodeId) -> Result<Vec<(String, InodeId)>, MetaError> {
        let prefix = children_prefix(parent);
        let pairs = self.kv.scan_prefix(&prefix)?;
        let mut out = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let name = String::from_utf8(key[prefix.len()..].to_vec())
                .map_err(|e| MetaError::Kv(e.to_string()))?;
            out.push((name, InodeId::new(decode_u64(&value)?)));
        }
        Ok(out)
    }

    // ── chunk rows ──────────────────────────────────────────────────────

    pub fn put_chunk(&self, chunk: &ChunkMeta) -> Result<(), MetaError> {
        self.kv.put(
            chunk_key(chunk.inode_id, chunk.version, chunk.chunk_index),
            encode(chunk)?,
        )
    }

    pub fn get_chunk(
        &self,
        inode: InodeId,
        version: u64,
        index: u32,
    ) -> Result<Option<ChunkMeta>, MetaError> {
        match self.kv.get(&chunk_key(inode, version, index))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All chunk rows of one file version, ordered by chunk index.
    pub fn get_chunks(&self, inode: InodeId, version: u64) -> Result<Vec<ChunkMeta>, MetaError> {
        let pairs = self.kv.scan_prefix(&chunk_version_prefix(inode, version))?;
        let mut chunks: Vec<ChunkMeta> = pairs
            .into_iter()
            .map(|(_, v)| decode(&v))
            .collect::<Result<_, _>>()?;
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    /// Deletes all chunk rows of one file version.
    pub fn delete_chunks(&self, inode: InodeId, version: u64) -> Result<(), MetaError> {
        let pairs = self.kv.scan_prefix(&chunk_version_prefix(inode, version))?;
        let ops = pairs
            .into_iter()
            .map(|(key, _)| BatchOp::Delete { key })
            .collect();
        self.kv.write_batch(ops)
    }

    /// Every chunk row in the store. Drives the orphan scan and the
    /// under-replication repair loop.
    pub fn scan_all_chunks(&self) -> Result<Vec<ChunkMeta>, MetaError> {
        let pairs = self.kv.scan_prefix(b"chunk:")?;
        pairs.into_iter().map(|(_, v)| decode(&v)).collect()
    }

    // ── chunk reference counts ──────────────────────────────────────────

    pub fn get_chunk_ref(&self, chunk_id: &ChunkId) -> Result<u64, MetaError> {
        match self.kv.get(&chunk_ref_key(chunk_id))? {
            Some(bytes) => decode_u64(&bytes),
            None => Ok(0),
        }
    }

    pub fn increment_chunk_ref(&self, chunk_id: &ChunkId) -> Result<u64, MetaError> {
        let count = self.get_chunk_ref(chunk_id)? + 1;
        self.kv
            .put(chunk_ref_key(chunk_id), count.to_string().into_bytes())?;
        Ok(count)
    }

    /// Decrements toward zero; a zero count removes the key.
    pub fn decrement_chunk_ref(&self, chunk_id: &ChunkId) -> Result<u64, MetaError> {
        let count = self.get_chunk_ref(chunk_id)?.saturating_sub(1);
        if count == 0 {
            self.kv.delete(&chunk_ref_key(chunk_id))?;
        } else {
            self.kv
                .put(chunk_ref_key(chunk_id), count.to_string().into_bytes())?;
        }
        Ok(count)
    }

    // ── storage-node registry ───────────────────────────────────────────

    pub fn put_server(&self, server: &ChunkServerInfo) -> Result<(), MetaError> {
        self.kv.put(server_key(&server.server_id), encode(server)?)
    }

    pub fn get_server(&self, id: &ServerId) -> Result<Option<ChunkServerInfo>, MetaError> {
        match self.kv.get(&server_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All registered servers, optionally filtered by status.
    pub fn list_servers(
        &self,
        status: Option<ServerStatus>,
    ) -> Result<Vec<ChunkServerInfo>, MetaError> {
        let pairs = self.kv.scan_prefix(b"server:")?;
        let mut out = Vec::new();
        for (_, value) in pairs {
            let server: ChunkServerInfo = decode(&value)?;
            if status.is_none() || status == Some(server.status) {
                out.push(server);
            }
        }
        Ok(out)
    }

    // ── upload sessions ─────────────────────────────────────────────────

    pub fn put_session(&self, session: &UploadSession) -> Result<(), MetaError> {
        self.kv
            .put(upload_key(&session.upload_id), encode(session)?)
    }

    pub fn get_session(&self, id: &UploadId) -> Result<Option<UploadSession>, MetaError> {
        match self.kv.get(&upload_key(id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete_session(&self, id: &UploadId) -> Result<(), MetaError> {
        self.kv.delete(&upload_key(id))
    }

    pub fn list_sessions(&self) -> Result<Vec<UploadSession>, MetaError> {
        let pairs = self.kv.scan_prefix(b"upload:")?;
        pairs.into_iter().map(|(_, v)| decode(&v)).collect()
    }

    /// Sessions past their expiry, due for the sweeper.
    pub fn list_expired_sessions(&self, now: Timestamp) -> Result<Vec<UploadSession>, MetaError> {
        Ok(self
            .list_sessions()?
            .into_iter()
            .filter(|s| s.is_expired(now))
            .collect())
    }
}
