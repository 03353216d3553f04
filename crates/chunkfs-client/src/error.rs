use chunkfs_meta::types::MetaError;

/// Errors surfaced to users of the client SDK.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// A metadata-plane error, passed through (NotFound, NotLeader, ...).
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// Every replica of a chunk failed or served bytes with a bad hash.
    #[error("download failed for chunk {chunk_index}: all replicas exhausted")]
    Download { chunk_index: u32 },

    #[error("upload failed: {0}")]
    Upload(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type ClientResult<T> = Result<T, ClientError>;
