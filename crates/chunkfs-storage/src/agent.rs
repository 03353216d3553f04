//! The storage-node agent: request handlers, chain replication, the
//! heartbeat loop, and the background scrub.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use chunkfs_meta::rpc::{ChunkTransport, MetaControl};
use chunkfs_meta::types::{ChunkId, ChunkIssueKind, Heartbeat, ServerId, HEARTBEAT_INTERVAL};

use crate::chunkstore::{ChunkHealth, ChunkStore};
use crate::error::StorageResult;

/// Configuration of one storage node.
pub struct StorageNodeConfig {
    pub server_id: ServerId,
    pub address: String,
    /// Availability zone advertised in heartbeats, used for placement.
    pub zone: String,
    pub capacity: u64,
    pub data_dir: PathBuf,
    pub heartbeat_interval: Duration,
    /// Pause between chunks during a scrub pass, to bound the IO impact.
    pub scrub_pause: Duration,
    /// Sleep between full scrub passes.
    pub scrub_interval: Duration,
}

impl StorageNodeConfig {
    pub fn new(server_id: ServerId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            address: format!("{}", server_id),
            server_id,
            zone: "default".to_string(),
            capacity: 0,
            data_dir: data_dir.into(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            scrub_pause: Duration::from_millis(100),
            scrub_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Findings of one scrub pass.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrubStats {
    pub checked: u64,
    pub missing: u64,
    pub corrupted: u64,
}

/// One storage node: the local chunk store plus its control loops.
pub struct StorageNode {
    config: StorageNodeConfig,
    store: ChunkStore,
    /// Data channel to sibling storage nodes, for chain replication.
    peers: Arc<dyn ChunkTransport>,
    /// Control channel to the metadata leader.
    control: Arc<dyn MetaControl>,
    running: AtomicBool,
}

impl StorageNode {
    pub fn new(
        config: StorageNodeConfig,
        peers: Arc<dyn ChunkTransport>,
        control: Arc<dyn MetaControl>,
    ) -> StorageResult<Arc<Self>> {
        let store = ChunkStore::open(&config.data_dir)?;
        Ok(Arc::new(Self {
            config,
            store,
            peers,
            control,
            running: AtomicBool::new(true),
        }))
    }

    pub fn server_id(&self) -> &ServerId {
        &self.config.server_id
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Spawns the heartbeat and scrub loops.
    pub fn start(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            while node.running.load(Ordering::SeqCst) {
                node.send_heartbeat().await;
                tokio::time::sleep(node.config.heartbeat_interval).await;
            }
        });

        let node = self.clone();
        tokio::spawn(async move {
            while node.running.load(Ordering::SeqCst) {
                let stats = node.scrub_pass().await;
                tracing::info!(
                    server = %node.config.server_id,
                    checked = stats.checked,
                    missing = stats.missing,
                    corrupted = stats.corrupted,
                    "scrub pass complete"
                );
                tokio::time::sleep(node.config.scrub_interval).await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // ── request handlers ────────────────────────────────────────────────

    /// Stores a chunk and forwards it down the replica chain. A downstream
    /// failure is logged but does not fail the write: the repair loop
    /// converges the replica count.
    pub async fn handle_upload(
        &self,
        chunk_id: &ChunkId,
        data: Bytes,
        checksum: &str,
        replicas: &[ServerId],
    ) -> StorageResult<()> {
        self.store.write(chunk_id, &data, checksum)?;

        if let Some((next, rest)) = replicas.split_first() {
            if let Err(e) = self
                .peers
                .upload_chunk(next, chunk_id, data, checksum, rest)
                .await
            {
                tracing::warn!(
                    chunk = %chunk_id,
                    next = %next,
                    error = %e,
                    "chain replication failed, leaving repair to converge"
                );
            }
        }
        Ok(())
    }

    pub fn handle_download(&self, chunk_id: &ChunkId) -> StorageResult<(Bytes, String)> {
        self.store.read(chunk_id)
    }

    pub fn handle_delete(&self, chunk_id: &ChunkId) -> StorageResult<()> {
        self.store.delete(chunk_id)
    }

    pub fn handle_list(&self) -> Vec<ChunkId> {
        self.store.list()
    }

    // ── heartbeat ───────────────────────────────────────────────────────

    pub fn heartbeat_payload(&self) -> Heartbeat {
        Heartbeat {
            server_id: self.config.server_id.clone(),
            address: self.config.address.clone(),
            capacity: self.config.capacity,
            used: self.store.used(),
            chunk_count: self.store.chunk_count(),
            zone: self.config.zone.clone(),
        }
    }

    async fn send_heartbeat(&self) {
        if let Err(e) = self.control.heartbeat(self.heartbeat_payload()).await {
            tracing::warn!(server = %self.config.server_id, error = %e, "heartbeat failed");
        }
    }

    // ── scrub ───────────────────────────────────────────────────────────

    /// Rehashes every local chunk. Missing files are reported and dropped
    /// from the index; corrupted files are reported and deleted. Either way
    /// the metadata plane stops counting this node as a holder.
    pub async fn scrub_pass(&self) -> ScrubStats {
        let mut stats = ScrubStats::default();
        for chunk_id in self.store.list() {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            stats.checked += 1;

            match self.store.verify_chunk(&chunk_id) {
                Ok(ChunkHealth::Ok) => {}
                Ok(ChunkHealth::Missing) => {
                    stats.missing += 1;
                    tracing::warn!(chunk = %chunk_id, "scrub: chunk file missing");
                    self.report_issue(&chunk_id, ChunkIssueKind::Missing).await;
                    self.store.drop_from_index(&chunk_id);
                }
                Ok(ChunkHealth::Corrupted) => {
                    stats.corrupted += 1;
                    tracing::warn!(chunk = %chunk_id, "scrub: chunk corrupted");
                    self.report_issue(&chunk_id, ChunkIssueKind::Corrupted).await;
                    if let Err(e) = self.store.delete(&chunk_id) {
                        tracing::warn!(chunk = %chunk_id, error = %e, "failed to delete corrupt chunk");
                    }
                }
                Err(e) => {
                    tracing::warn!(chunk = %chunk_id, error = %e, "scrub read failed");
                }
            }

            if !self.config.scrub_pause.is_zero() {
                tokio::time::sleep(self.config.scrub_pause).await;
            }
        }
        stats
    }

    async fn report_issue(&self, chunk_id: &ChunkId, kind: ChunkIssueKind) {
        if let Err(e) = self
            .control
            .report_chunk_issue(&self.config.server_id, chunk_id, kind)
            .await
        {
            tracing::warn!(chunk = %chunk_id, error = %e, "chunk issue report failed");
        }
    }
}
