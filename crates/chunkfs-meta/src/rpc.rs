//! Transport seams between the planes.
//!
//! The wire encoding is not this crate's concern: consensus traffic, the
//! client-facing control channel, and the storage data channel each go
//! through an object-safe trait. Production backends put a codec behind
//! them; tests wire them in-process.

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, ChunkId, ChunkIssueKind, ChunkMeta,
    ChunkServerInfo, Heartbeat, Inode, MetaError, NodeId, ServerId, UploadId, UploadSession,
    VoteRequest, VoteResponse,
};

/// A transport-level failure. Always retryable from the caller's point of
/// view; permanent conditions travel inside the response types instead.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("peer unavailable: {0}")]
    Unavailable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// The peer processed the request and refused it.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// Consensus traffic between metadata nodes.
#[async_trait]
pub trait RaftTransport: Send + Sync {
    async fn request_vote(
        &self,
        peer: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, RpcError>;

    async fn append_entries(
        &self,
        peer: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError>;
}

/// Data-channel operations against storage nodes, addressed by server id.
/// Used by clients (uploads, downloads), by storage nodes themselves (chain
/// replication), and by the metadata plane (GC deletes, repair copies,
/// orphan-scan inventory).
#[async_trait]
pub trait ChunkTransport: Send + Sync {
    /// Stores a chunk on `server`. The server verifies the checksum, writes
    /// locally, and forwards to `replicas` down the chain.
    async fn upload_chunk(
        &self,
        server: &ServerId,
        chunk_id: &ChunkId,
        data: Bytes,
        checksum: &str,
        replicas: &[ServerId],
    ) -> Result<(), RpcError>;

    /// Fetches a chunk's bytes and stored checksum from `server`.
    async fn download_chunk(
        &self,
        server: &ServerId,
        chunk_id: &ChunkId,
    ) -> Result<(Bytes, String), RpcError>;

    /// Removes a chunk from `server`. Deleting an absent chunk succeeds.
    async fn delete_chunk(&self, server: &ServerId, chunk_id: &ChunkId) -> Result<(), RpcError>;

    /// Enumerates every chunk held by `server`.
    async fn list_chunks(&self, server: &ServerId) -> Result<Vec<ChunkId>, RpcError>;
}

/// Control-channel operations a storage node performs against the metadata
/// leader.
#[async_trait]
pub trait MetaControl: Send + Sync {
    async fn heartbeat(&self, hb: Heartbeat) -> Result<(), RpcError>;

    async fn report_chunk_issue(
        &self,
        server_id: &ServerId,
        chunk_id: &ChunkId,
        kind: ChunkIssueKind,
    ) -> Result<(), RpcError>;
}

/// The client-facing metadata API, served by the leader. Domain errors
/// (`NotLeader`, `AlreadyExists`, ...) pass through unwrapped so clients can
/// react to them.
#[async_trait]
pub trait MetadataApi: Send + Sync {
    async fn create_directory(&self, path: &str) -> Result<Inode, MetaError>;

    async fn list_directory(&self, path: &str) -> Result<Vec<Inode>, MetaError>;

    async fn delete(&self, path: &str) -> Result<(), MetaError>;

    async fn delete_recursive(&self, path: &str) -> Result<(), MetaError>;

    async fn resolve_path(&self, path: &str) -> Result<Option<Inode>, MetaError>;

    async fn init_upload(&self, path: &str, size: u64) -> Result<UploadSession, MetaError>;

    async fn commit_upload(
        &self,
        upload_id: &UploadId,
        checksums: Vec<String>,
    ) -> Result<Inode, MetaError>;

    async fn abort_upload(&self, upload_id: &UploadId) -> Result<(), MetaError>;

    async fn get_upload_session(
        &self,
        upload_id: &UploadId,
    ) -> Result<Option<UploadSession>, MetaError>;

    async fn get_file_metadata(
        &self,
        path: &str,
        version: Option<u64>,
    ) -> Result<(Inode, Vec<ChunkMeta>), MetaError>;

    async fn get_server(&self, server_id: &ServerId)
        -> Result<Option<ChunkServerInfo>, MetaError>;
}
