use chunkfs_meta::types::ChunkId;

/// Errors surfaced by a storage node.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The bytes of an incoming write do not hash to the claimed checksum.
    #[error("checksum mismatch for chunk {chunk_id}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        chunk_id: ChunkId,
        expected: String,
        actual: String,
    },

    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkId),

    /// A stored chunk's bytes no longer match its recorded checksum.
    #[error("chunk corrupted: {0}")]
    ChunkCorrupted(ChunkId),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;
