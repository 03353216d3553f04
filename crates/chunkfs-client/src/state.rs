//! Resumable upload state.
//!
//! After every successful chunk the client rewrites a small JSON state file
//! (atomically, tmp + rename). A restarted client re-fetches the session:
//! if it is still valid, only the missing indices are transferred; if it
//! expired, the upload restarts from scratch. A successful commit removes
//! the file.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use chunkfs_meta::types::UploadId;

/// Persisted progress of one resumable upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadState {
    pub upload_id: UploadId,
    pub remote_path: String,
    /// Indices whose chunks are fully stored on their primaries.
    pub completed_chunks: BTreeSet<u32>,
    /// Checksums accumulated by chunk index, as commit requires.
    pub checksums: BTreeMap<u32, String>,
}

impl UploadState {
    pub fn new(upload_id: UploadId, remote_path: impl Into<String>) -> Self {
        Self {
            upload_id,
            remote_path: remote_path.into(),
            completed_chunks: BTreeSet::new(),
            checksums: BTreeMap::new(),
        }
    }

    pub fn record_chunk(&mut self, index: u32, checksum: String) {
        self.completed_chunks.insert(index);
        self.checksums.insert(index, checksum);
    }

    /// Loads previously saved state. A missing or unreadable file reads as
    /// no state: the upload simply starts over.
    pub fn load(path: &Path) -> Option<UploadState> {
        let bytes = fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "discarding unreadable upload state");
                None
            }
        }
    }

    /// Atomically replaces the state file.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let bytes = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)
    }

    pub fn remove(path: &Path) {
        let _ = fs::remove_file(path);
    }
}
