//! The client SDK.
//!
//! Talks to the metadata leader over the control channel and to storage
//! nodes over the data channel. Uploads are two-phase: `init_upload`
//! reserves a session with per-chunk placements, chunk writes go straight
//! to the primaries (which chain to their replicas), and `commit_upload`
//! publishes the version. Downloads verify SHA-256 per chunk and fail over
//! across the replica list.

use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use chunkfs_meta::rpc::{ChunkTransport, MetadataApi};
use chunkfs_meta::types::{ChunkAllocation, ChunkMeta, Inode, ServerId, UploadSession, CHUNK_SIZE};
use chunkfs_storage::checksum::sha256_hex;

use crate::error::{ClientError, ClientResult};
use crate::state::UploadState;

/// Client tunables. `chunk_size` must match the metadata plane's.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub chunk_size: u64,
    /// Concurrent chunk transfers in the parallel paths.
    pub max_workers: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_workers: 4,
        }
    }
}

pub struct Client {
    meta: Arc<dyn MetadataApi>,
    chunks: Arc<dyn ChunkTransport>,
    config: ClientConfig,
}

impl Client {
    pub fn new(meta: Arc<dyn MetadataApi>, chunks: Arc<dyn ChunkTransport>) -> Self {
        Self::with_config(meta, chunks, ClientConfig::default())
    }

    pub fn with_config(
        meta: Arc<dyn MetadataApi>,
        chunks: Arc<dyn ChunkTransport>,
        config: ClientConfig,
    ) -> Self {
        Self {
            meta,
            chunks,
            config,
        }
    }

    // ── namespace ───────────────────────────────────────────────────────

    pub async fn mkdir(&self, path: &str) -> ClientResult<Inode> {
        Ok(self.meta.create_directory(path).await?)
    }

    pub async fn ls(&self, path: &str) -> ClientResult<Vec<Inode>> {
        Ok(self.meta.list_directory(path).await?)
    }

    pub async fn stat(&self, path: &str) -> ClientResult<Inode> {
        self.meta
            .resolve_path(path)
            .await?
            .ok_or_else(|| ClientError::Meta(chunkfs_meta::types::MetaError::NotFound(path.to_string())))
    }

    pub async fn exists(&self, path: &str) -> ClientResult<bool> {
        Ok(self.meta.resolve_path(path).await?.is_some())
    }

    pub async fn rm(&self, path: &str) -> ClientResult<()> {
        Ok(self.meta.delete(path).await?)
    }

    pub async fn rm_recursive(&self, path: &str) -> ClientResult<()> {
        Ok(self.meta.delete_recursive(path).await?)
    }

    // ── upload ──────────────────────────────────────────────────────────

    /// Uploads a file, one chunk at a time.
    pub async fn put(&self, local: &Path, remote: &str) -> ClientResult<Inode> {
        let session = self.open_session(local, remote).await?;
        match self.upload_sequential(local, &session).await {
            Ok(checksums) => Ok(self.meta.commit_upload(&session.upload_id, checksums).await?),
            Err(e) => {
                let _ = self.meta.abort_upload(&session.upload_id).await;
                Err(e)
            }
        }
    }

    /// Uploads a file with up to `max_workers` concurrent chunk transfers.
    pub async fn put_parallel(&self, local: &Path, remote: &str) -> ClientResult<Inode> {
        let session = self.open_session(local, remote).await?;
        match self.upload_parallel(local, &session).await {
            Ok(checksums) => Ok(self.meta.commit_upload(&session.upload_id, checksums).await?),
            Err(e) => {
                let _ = self.meta.abort_upload(&session.upload_id).await;
                Err(e)
            }
        }
    }

    /// Uploads a file, persisting progress to `state_path` after every
    /// chunk. Re-running after a crash transfers only the missing indices;
    /// an expired session starts the upload over. A successful commit
    /// removes the state file. The upload is NOT aborted on failure, since
    /// the state file is the claim ticket for resuming it.
    pub async fn put_resumable(
        &self,
        local: &Path,
        remote: &str,
        state_path: &Path,
    ) -> ClientResult<Inode> {
        let mut resumed = UploadState::load(state_path).filter(|s| s.remote_path == remote);
        let mut session = None;
        if let Some(state) = &resumed {
            session = self.meta.get_upload_session(&state.upload_id).await?;
            if session.is_none() {
                tracing::info!(remote, "previous upload session expired, starting over");
                resumed = None;
            }
        }
        let (mut state, session) = match (resumed, session) {
            (Some(state), Some(session)) => (state, session),
            _ => {
                let session = self.open_session(local, remote).await?;
                (
                    UploadState::new(session.upload_id.clone(), remote),
                    session,
                )
            }
        };

        for allocation in &session.chunks {
            if state.completed_chunks.contains(&allocation.chunk_index) {
                continue;
            }
            let data = read_chunk(local, allocation.chunk_index, self.config.chunk_size).await?;
            let checksum = self.upload_chunk(allocation, data).await?;
            state.record_chunk(allocation.chunk_index, checksum);
            state.save(state_path)?;
        }

        let checksums = session
            .chunks
            .iter()
            .map(|a| {
                state
                    .checksums
                    .get(&a.chunk_index)
                    .cloned()
                    .ok_or_else(|| {
                        ClientError::Upload(format!("missing checksum for chunk {}", a.chunk_index))
                    })
            })
            .collect::<ClientResult<Vec<_>>>()?;

        let inode = self.meta.commit_upload(&session.upload_id, checksums).await?;
        UploadState::remove(state_path);
        Ok(inode)
    }

    async fn open_session(&self, local: &Path, remote: &str) -> ClientResult<UploadSession> {
        let size = tokio::fs::metadata(local).await?.len();
        Ok(self.meta.init_upload(remote, size).await?)
    }

    async fn upload_sequential(
        &self,
        local: &Path,
        session: &UploadSession,
    ) -> ClientResult<Vec<String>> {
        let mut checksums = Vec::with_capacity(session.chunks.len());
        for allocation in &session.chunks {
            let data = read_chunk(local, allocation.chunk_index, self.config.chunk_size).await?;
            checksums.push(self.upload_chunk(allocation, data).await?);
        }
        Ok(checksums)
    }

    async fn upload_parallel(
        &self,
        local: &Path,
        session: &UploadSession,
    ) -> ClientResult<Vec<String>> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut set: JoinSet<ClientResult<(u32, String)>> = JoinSet::new();

        for allocation in session.chunks.clone() {
            let semaphore = semaphore.clone();
            let chunks = self.chunks.clone();
            let local: PathBuf = local.to_path_buf();
            let chunk_size = self.config.chunk_size;
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ClientError::Upload("worker pool closed".to_string()))?;
                let data = read_chunk(&local, allocation.chunk_index, chunk_size).await?;
                let checksum = sha256_hex(&data);
                let (primary, rest) = primary_of(&allocation)?;
                chunks
                    .upload_chunk(primary, &allocation.chunk_id, Bytes::from(data), &checksum, rest)
                    .await
                    .map_err(|e| {
                        ClientError::Upload(format!("chunk {}: {}", allocation.chunk_index, e))
                    })?;
                Ok((allocation.chunk_index, checksum))
            });
        }

        // Checksums accumulate by index, not completion order.
        let mut by_index = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            let (index, checksum) = joined.map_err(|e| ClientError::Upload(e.to_string()))??;
            by_index.insert(index, checksum);
        }
        if by_index.len() != session.chunks.len() {
            return Err(ClientError::Upload(
                "not every chunk index completed".to_string(),
            ));
        }
        Ok(by_index.into_values().collect())
    }

    async fn upload_chunk(
        &self,
        allocation: &ChunkAllocation,
        data: Vec<u8>,
    ) -> ClientResult<String> {
        let checksum = sha256_hex(&data);
        let (primary, rest) = primary_of(allocation)?;
        self.chunks
            .upload_chunk(primary, &allocation.chunk_id, Bytes::from(data), &checksum, rest)
            .await
            .map_err(|e| {
                ClientError::Upload(format!("chunk {}: {}", allocation.chunk_index, e))
            })?;
        Ok(checksum)
    }

    // ── download ────────────────────────────────────────────────────────

    /// Downloads a file, one chunk at a time, into `local`.
    pub async fn get(&self, remote: &str, local: &Path) -> ClientResult<()> {
        let (_inode, chunks) = self.meta.get_file_metadata(remote, None).await?;

        let mut file = tokio::fs::File::create(local).await?;
        for chunk in &chunks {
            let data = fetch_chunk(&self.chunks, chunk).await?;
            file.write_all(&data).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Downloads a file with concurrent chunk transfers. The output file is
    /// pre-allocated to the full size and each chunk lands at
    /// `index * chunk_size`.
    pub async fn get_parallel(&self, remote: &str, local: &Path) -> ClientResult<()> {
        let (inode, chunks) = self.meta.get_file_metadata(remote, None).await?;

        let file = tokio::fs::File::create(local).await?;
        file.set_len(inode.size).await?;
        drop(file);

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers));
        let mut set: JoinSet<ClientResult<()>> = JoinSet::new();
        for chunk in chunks {
            let semaphore = semaphore.clone();
            let transport = self.chunks.clone();
            let local: PathBuf = local.to_path_buf();
            let chunk_size = self.config.chunk_size;
            set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| ClientError::Upload("worker pool closed".to_string()))?;
                let data = fetch_chunk(&transport, &chunk).await?;
                let mut file = tokio::fs::OpenOptions::new()
                    .write(true)
                    .open(&local)
                    .await?;
                file.seek(SeekFrom::Start(chunk.chunk_index as u64 * chunk_size))
                    .await?;
                file.write_all(&data).await?;
                file.flush().await?;
                Ok(())
            });
        }

        while let Some(joined) = set.join_next().await {
            joined.map_err(|e| ClientError::Upload(e.to_string()))??;
        }
        Ok(())
    }
}

fn primary_of(allocation: &ChunkAllocation) -> ClientResult<(&ServerId, &[ServerId])> {
    allocation.servers.split_first().ok_or_else(|| {
        ClientError::Upload(format!(
            "chunk {} has no storage servers assigned",
            allocation.chunk_index
        ))
    })
}

/// Fetches one chunk, trying each listed replica in order. Bytes win only
/// if their SHA-256 matches the metadata checksum; a corrupt or unreachable
/// replica just moves the client to the next one.
async fn fetch_chunk(
    transport: &Arc<dyn ChunkTransport>,
    chunk: &ChunkMeta,
) -> ClientResult<Bytes> {
    for server in &chunk.servers {
        match transport.download_chunk(server, &chunk.chunk_id).await {
            Ok((data, _)) => {
                if sha256_hex(&data) == chunk.checksum {
                    return Ok(data);
                }
                tracing::warn!(
                    chunk = %chunk.chunk_id,
                    server = %server,
                    "replica served bytes with a bad hash, trying next"
                );
            }
            Err(e) => {
                tracing::warn!(
                    chunk = %chunk.chunk_id,
                    server = %server,
                    error = %e,
                    "replica unavailable, trying next"
                );
            }
        }
    }
    Err(ClientError::Download {
        chunk_index: chunk.chunk_index,
    })
}

/// Reads the `index`-th chunk-sized slice of a local file. The final slice
/// may be short.
async fn read_chunk(path: &Path, index: u32, chunk_size: u64) -> ClientResult<Vec<u8>> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(index as u64 * chunk_size)).await?;
    let mut buf = Vec::with_capacity(chunk_size as usize);
    file.take(chunk_size).read_to_end(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_chunk_slices() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input");
        tokio::fs::write(&path, b"0123456789").await.unwrap();

        assert_eq!(read_chunk(&path, 0, 4).await.unwrap(), b"0123");
        assert_eq!(read_chunk(&path, 1, 4).await.unwrap(), b"4567");
        // The final chunk is short.
        assert_eq!(read_chunk(&path, 2, 4).await.unwrap(), b"89");
        // Past the end reads empty.
        assert!(read_chunk(&path, 3, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_chunk_of_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty");
        tokio::fs::write(&path, b"").await.unwrap();
        assert!(read_chunk(&path, 0, 4).await.unwrap().is_empty());
    }
}
