//! Under-replication repair.
//!
//! The `servers[]` field of a chunk row records where replicas are believed
//! to be. Heartbeat timeouts, scrub reports, and lost disks all erode that
//! set; this loop walks every chunk row, counts the holders that are still
//! ONLINE, and copies the chunk onto fresh servers until the replica target
//! is met again. The widened server set is proposed back through the log.

use std::collections::HashMap;
use std::sync::Arc;

use crate::rpc::ChunkTransport;
use crate::service::ConsensusHandle;
use crate::store::MetadataStore;
use crate::types::{
    ChunkMeta, ChunkServerInfo, Command, MetaError, ServerId, ServerStatus, REPLICATION_FACTOR,
};

/// Result of one repair pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RepairStats {
    pub chunks_scanned: usize,
    pub under_replicated: usize,
    pub replicas_added: usize,
    pub failures: usize,
}

pub struct Replicator {
    store: Arc<MetadataStore>,
    consensus: Arc<dyn ConsensusHandle>,
    chunks: Arc<dyn ChunkTransport>,
    replication_factor: usize,
    interval: std::time::Duration,
    kick: tokio::sync::Notify,
    running: std::sync::atomic::AtomicBool,
}

impl Replicator {
    pub fn new(
        store: Arc<MetadataStore>,
        consensus: Arc<dyn ConsensusHandle>,
        chunks: Arc<dyn ChunkTransport>,
    ) -> Self {
        Self {
            store,
            consensus,
            chunks,
            replication_factor: REPLICATION_FACTOR,
            interval: std::time::Duration::from_secs(300),
            kick: tokio::sync::Notify::new(),
            running: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn with_replication_factor(mut self, replication_factor: usize) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn with_interval(mut self, interval: std::time::Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawns the periodic repair loop. A [`Self::kick`] (issued when a
    /// server goes OFFLINE) runs a pass immediately instead of waiting out
    /// the interval.
    pub fn start(self: &Arc<Self>) {
        use std::sync::atomic::Ordering;

        let repl = self.clone();
        tokio::spawn(async move {
            while repl.running.load(Ordering::SeqCst) {
                tokio::select! {
                    _ = tokio::time::sleep(repl.interval) => {}
                    _ = repl.kick.notified() => {}
                }
                if !repl.consensus.is_leader() {
                    continue;
                }
                match repl.repair_once().await {
                    Ok(stats) if stats.under_replicated > 0 => tracing::info!(
                        scanned = stats.chunks_scanned,
                        under_replicated = stats.under_replicated,
                        added = stats.replicas_added,
                        failures = stats.failures,
                        "repair pass complete"
                    ),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "repair pass failed"),
                }
            }
        });
    }

    /// Requests an immediate repair pass.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    pub fn stop(&self) {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Scans every chunk row and tops up replicas where fewer than the
    /// target number of holders are ONLINE.
    pub async fn repair_once(&self) -> Result<RepairStats, MetaError> {
        let registry: HashMap<ServerId, ChunkServerInfo> = self
            .store
            .list_servers(None)?
            .into_iter()
            .map(|s| (s.server_id.clone(), s))
            .collect();

        let mut stats = RepairStats::default();
        for chunk in self.store.scan_all_chunks()? {
            stats.chunks_scanned += 1;

            let online_holders: Vec<&ServerId> = chunk
                .servers
                .iter()
                .filter(|s| {
                    registry
                        .get(s)
                        .is_some_and(|info| info.status == ServerStatus::Online)
                })
                .collect();
            if online_holders.len() >= self.replication_factor {
                continue;
            }
            stats.under_replicated += 1;

            let source = match online_holders.first() {
                Some(source) => (*source).clone(),
                None => {
                    tracing::warn!(chunk = %chunk.chunk_id, "no healthy source replica");
                    stats.failures += 1;
                    continue;
                }
            };

            let mut candidates: Vec<&ChunkServerInfo> = registry
                .values()
                .filter(|info| {
                    info.status == ServerStatus::Online && !chunk.servers.contains(&info.server_id)
                })
                .collect();
            candidates.sort_by(|a, b| {
                b.available()
                    .cmp(&a.available())
                    .then_with(|| a.server_id.cmp(&b.server_id))
            });

            let needed = self.replication_factor - online_holders.len();
            let mut added = Vec::new();
            for target in candidates.into_iter().take(needed) {
                match self.copy(&source, &target.server_id, &chunk).await {
                    Ok(()) => added.push(target.server_id.clone()),
                    Err(e) => {
                        tracing::warn!(
                            chunk = %chunk.chunk_id,
                            source = %source,
                            target = %target.server_id,
                            error = %e,
                            "replica copy failed"
                        );
                        stats.failures += 1;
                    }
                }
            }

            if !added.is_empty() {
                stats.replicas_added += added.len();
                tracing::info!(
                    chunk = %chunk.chunk_id,
                    added = ?added,
                    "restored replicas"
                );
                let mut updated = chunk.clone();
                updated.servers.extend(added);
                self.consensus
                    .propose(Command::PutChunk { chunk: updated })
                    .await?;
            }
        }
        Ok(stats)
    }

    async fn copy(
        &self,
        source: &ServerId,
        target: &ServerId,
        chunk: &ChunkMeta,
    ) -> Result<(), MetaError> {
        let (data, checksum) = self
            .chunks
            .download_chunk(source, &chunk.chunk_id)
            .await
            .map_err(|e| MetaError::StorageUnavailable(e.to_string()))?;
        if checksum != chunk.checksum {
            return Err(MetaError::StorageUnavailable(format!(
                "source {} serves a stale copy of {}",
                source, chunk.chunk_id
            )));
        }
        self.chunks
            .upload_chunk(target, &chunk.chunk_id, data, &chunk.checksum, &[])
            .await
            .map_err(|e| MetaError::StorageUnavailable(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{bootstrap_store, DirectConsensus, FakeChunkNet};
    use crate::types::{ChunkId, Inode, InodeId, InodeStatus, Timestamp};
    use bytes::Bytes;

    struct Fixture {
        store: Arc<MetadataStore>,
        net: Arc<FakeChunkNet>,
        replicator: Replicator,
    }

    fn fixture() -> Fixture {
        let store = bootstrap_store();
        let consensus = Arc::new(DirectConsensus::new(store.clone()));
        let net = Arc::new(FakeChunkNet::new());
        let replicator = Replicator::new(store.clone(), consensus, net.clone())
            .with_replication_factor(3);
        Fixture {
            store,
            net,
            replicator,
        }
    }

    fn register(fx: &Fixture, id: &str, status: ServerStatus, available: u64) {
        fx.store
            .put_server(&ChunkServerInfo {
                server_id: ServerId::new(id),
                address: format!("{}:7000", id),
                capacity: available,
                used: 0,
                chunk_count: 0,
                zone: "z1".to_string(),
                status,
                last_heartbeat: Timestamp::now(),
            })
            .unwrap();
    }

    async fn seed_file_chunk(fx: &Fixture, servers: &[&str]) -> ChunkMeta {
        let mut inode =
            Inode::new_uploading_file(InodeId::new(2), InodeId::ROOT, "f", 4, 1, "tester");
        inode.status = InodeStatus::Active;
        fx.store.put_inode(&inode).unwrap();

        let chunk = ChunkMeta {
            chunk_id: ChunkId::new("c1"),
            inode_id: InodeId::new(2),
            version: 1,
            chunk_index: 0,
            size: 4,
            checksum: "feed".to_string(),
            servers: servers.iter().map(|s| ServerId::new(*s)).collect(),
        };
        fx.store.put_chunk(&chunk).unwrap();
        fx.store.increment_chunk_ref(&chunk.chunk_id).unwrap();

        for server in servers {
            fx.net.seed(
                &ServerId::new(*server),
                "c1",
                Bytes::from_static(b"data"),
                "feed",
            );
        }
        chunk
    }

    #[tokio::test]
    async fn test_fully_replicated_chunk_untouched() {
        let fx = fixture();
        for id in ["s0", "s1", "s2"] {
            register(&fx, id, ServerStatus::Online, 1000);
        }
        seed_file_chunk(&fx, &["s0", "s1", "s2"]).await;

        let stats = fx.replicator.repair_once().await.unwrap();
        assert_eq!(stats.chunks_scanned, 1);
        assert_eq!(stats.under_replicated, 0);
        assert_eq!(stats.replicas_added, 0);
    }

    #[tokio::test]
    async fn test_offline_holder_triggers_copy() {
        let fx = fixture();
        register(&fx, "s0", ServerStatus::Online, 1000);
        register(&fx, "s1", ServerStatus::Online, 1000);
        register(&fx, "s2", ServerStatus::Offline, 1000);
        register(&fx, "s3", ServerStatus::Online, 2000);
        seed_file_chunk(&fx, &["s0", "s1", "s2"]).await;

        let stats = fx.replicator.repair_once().await.unwrap();
        assert_eq!(stats.under_replicated, 1);
        assert_eq!(stats.replicas_added, 1);
        assert!(fx.net.holds(&ServerId::new("s3"), &ChunkId::new("c1")));

        let row = fx
            .store
            .get_chunk(InodeId::new(2), 1, 0)
            .unwrap()
            .unwrap();
        assert!(row.servers.contains(&ServerId::new("s3")));
        // The believed-offline holder stays listed; scrub decides its fate.
        assert!(row.servers.contains(&ServerId::new("s2")));
    }

    #[tokio::test]
    async fn test_no_healthy_source_is_a_failure() {
        let fx = fixture();
        register(&fx, "s0", ServerStatus::Offline, 1000);
        register(&fx, "s3", ServerStatus::Online, 1000);
        seed_file_chunk(&fx, &["s0"]).await;

        let stats = fx.replicator.repair_once().await.unwrap();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.replicas_added, 0);
        assert!(!fx.net.holds(&ServerId::new("s3"), &ChunkId::new("c1")));
    }

    #[tokio::test]
    async fn test_unreachable_target_counts_as_failure() {
        let fx = fixture();
        register(&fx, "s0", ServerStatus::Online, 1000);
        register(&fx, "s3", ServerStatus::Online, 1000);
        seed_file_chunk(&fx, &["s0"]).await;
        fx.net.down.lock().unwrap().insert(ServerId::new("s3"));

        let stats = fx.replicator.repair_once().await.unwrap();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.replicas_added, 0);
    }

    #[tokio::test]
    async fn test_most_spacious_target_chosen_first() {
        let fx = fixture();
        register(&fx, "s0", ServerStatus::Online, 1000);
        register(&fx, "small", ServerStatus::Online, 10);
        register(&fx, "big", ServerStatus::Online, 10_000);
        seed_file_chunk(&fx, &["s0"]).await;

        let stats = fx.replicator.repair_once().await.unwrap();
        assert_eq!(stats.replicas_added, 2);

        let row = fx
            .store
            .get_chunk(InodeId::new(2), 1, 0)
            .unwrap()
            .unwrap();
        assert_eq!(row.servers[1], ServerId::new("big"));
        assert_eq!(row.servers[2], ServerId::new("small"));
    }
}
