//! The local chunk store.
//!
//! Chunks live under `<data_dir>/<first-4-chars>/<chunk_id>`. Writes go to a
//! `.tmp` sibling, fsync, then rename; the rename is the linearization
//! point, so a crash mid-write leaves only a stray `.tmp` that the startup
//! scan deletes. The in-memory index is a cache: it is rebuilt from disk by
//! rehashing every file on startup.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use chunkfs_meta::types::{ChunkId, Timestamp};

use crate::checksum::sha256_hex;
use crate::error::{StorageError, StorageResult};

/// Index entry for one locally-held chunk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_id: ChunkId,
    pub size: u64,
    pub checksum: String,
    pub created_at: Timestamp,
}

/// Outcome of verifying one chunk on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkHealth {
    Ok,
    /// The file vanished from disk.
    Missing,
    /// The file's bytes no longer hash to the recorded checksum.
    Corrupted,
}

pub struct ChunkStore {
    data_dir: PathBuf,
    index: Mutex<HashMap<ChunkId, ChunkInfo>>,
    used: AtomicU64,
}

impl ChunkStore {
    /// Opens the store, deleting leftover `.tmp` files and rebuilding the
    /// index by rehashing every chunk file.
    pub fn open(data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;

        let store = Self {
            data_dir,
            index: Mutex::new(HashMap::new()),
            used: AtomicU64::new(0),
        };
        store.scan()?;
        Ok(store)
    }

    fn chunk_path(&self, chunk_id: &ChunkId) -> PathBuf {
        let id = chunk_id.as_str();
        let shard = &id[..id.len().min(4)];
        self.data_dir.join(shard).join(id)
    }

    fn scan(&self) -> StorageResult<()> {
        let mut index = self.index.lock();
        index.clear();
        self.used.store(0, Ordering::SeqCst);

        for shard in fs::read_dir(&self.data_dir)? {
            let shard = shard?.path();
            if !shard.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&shard)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    tracing::info!(path = %path.display(), "removing incomplete chunk write");
                    fs::remove_file(&path)?;
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let data = fs::read(&path)?;
                let info = ChunkInfo {
                    chunk_id: ChunkId::new(name),
                    size: data.len() as u64,
                    checksum: sha256_hex(&data),
                    created_at: file_timestamp(&path),
                };
                self.used.fetch_add(info.size, Ordering::SeqCst);
                index.insert(info.chunk_id.clone(), info);
            }
        }

        tracing::info!(
            chunks = index.len(),
            used = self.used.load(Ordering::SeqCst),
            dir = %self.data_dir.display(),
            "chunk store scanned"
        );
        Ok(())
    }

    /// Writes a chunk atomically after verifying the claimed checksum.
    pub fn write(&self, chunk_id: &ChunkId, data: &[u8], checksum: &str) -> StorageResult<()> {
        let actual = sha256_hex(data);
        if actual != checksum {
            return Err(StorageError::ChecksumMismatch {
                chunk_id: chunk_id.clone(),
                expected: checksum.to_string(),
                actual,
            });
        }

        let path = self.chunk_path(chunk_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension("tmp");
        let result = (|| -> std::io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(data)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        let mut index = self.index.lock();
        if let Some(old) = index.get(chunk_id) {
            self.used.fetch_sub(old.size, Ordering::SeqCst);
        }
        self.used.fetch_add(data.len() as u64, Ordering::SeqCst);
        index.insert(
            chunk_id.clone(),
            ChunkInfo {
                chunk_id: chunk_id.clone(),
                size: data.len() as u64,
                checksum: checksum.to_string(),
                created_at: Timestamp::now(),
            },
        );
        Ok(())
    }

    /// Reads a chunk and its checksum, verifying the bytes against the
    /// index on the way out.
    pub fn read(&self, chunk_id: &ChunkId) -> StorageResult<(Bytes, String)> {
        let path = self.chunk_path(chunk_id);
        if !path.exists() {
            return Err(StorageError::ChunkNotFound(chunk_id.clone()));
        }
        let data = fs::read(&path)?;

        let expected = self
            .index
            .lock()
            .get(chunk_id)
            .map(|info| info.checksum.clone());
        let checksum = match expected {
            Some(expected) => {
                if sha256_hex(&data) != expected {
                    return Err(StorageError::ChunkCorrupted(chunk_id.clone()));
                }
                expected
            }
            None => sha256_hex(&data),
        };
        Ok((Bytes::from(data), checksum))
    }

    /// Removes a chunk's file and index entry. Absent chunks are fine.
    pub fn delete(&self, chunk_id: &ChunkId) -> StorageResult<()> {
        let path = self.chunk_path(chunk_id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        if let Some(old) = self.index.lock().remove(chunk_id) {
            self.used.fetch_sub(old.size, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Drops a chunk from the index without touching disk. Used when a
    /// scrub finds the file already gone.
    pub fn drop_from_index(&self, chunk_id: &ChunkId) {
        if let Some(old) = self.index.lock().remove(chunk_id) {
            self.used.fetch_sub(old.size, Ordering::SeqCst);
        }
    }

    /// Rehashes one chunk's file against the index.
    pub fn verify_chunk(&self, chunk_id: &ChunkId) -> StorageResult<ChunkHealth> {
        let info = match self.index.lock().get(chunk_id) {
            Some(info) => info.clone(),
            None => return Ok(ChunkHealth::Missing),
        };
        let path = self.chunk_path(chunk_id);
        if !path.exists() {
            return Ok(ChunkHealth::Missing);
        }
        let data = fs::read(&path)?;
        if sha256_hex(&data) != info.checksum {
            return Ok(ChunkHealth::Corrupted);
        }
        Ok(ChunkHealth::Ok)
    }

    pub fn contains(&self, chunk_id: &ChunkId) -> bool {
        self.index.lock().contains_key(chunk_id)
    }

    pub fn info(&self, chunk_id: &ChunkId) -> Option<ChunkInfo> {
        self.index.lock().get(chunk_id).cloned()
    }

    pub fn list(&self) -> Vec<ChunkId> {
        self.index.lock().keys().cloned().collect()
    }

    pub fn chunk_count(&self) -> u64 {
        self.index.lock().len() as u64
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// The backing file of a chunk.
    pub fn path_of(&self, chunk_id: &ChunkId) -> PathBuf {
        self.chunk_path(chunk_id)
    }
}

fn file_timestamp(path: &Path) -> Timestamp {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| Timestamp::from_secs(d.as_secs()))
        .unwrap_or_else(Timestamp::now)
}
