//! Garbage collection: lazy namespace teardown, grace-period physical chunk
//! deletion, and the orphan scan.
//!
//! Foreground deletes only tombstone an inode and detach its edge. The
//! expensive work of walking subtrees, releasing chunk references, and
//! deleting bytes off storage nodes runs here, in batches, off the request
//! path.
//! Deletion RPCs are best-effort: anything they miss, the orphan scan
//! reclaims on its next pass.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::rpc::ChunkTransport;
use crate::service::ConsensusHandle;
use crate::store::MetadataStore;
use crate::types::{
    ChunkGcEntry, ChunkId, Command, InodeId, MetaError, ServerStatus, Timestamp, GC_BATCH_SIZE,
};

/// A unit of background teardown work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GcTask {
    /// Tear down a single detached inode (file or empty directory).
    Inode { inode: InodeId },
    /// Walk and tear down a detached directory subtree.
    Subtree { inode: InodeId },
}

/// Queue of teardown tasks, fed by the service and drained by the pipeline.
pub struct GcQueue {
    tasks: Mutex<Vec<GcTask>>,
}

impl GcQueue {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, task: GcTask) {
        self.tasks.lock().expect("lock poisoned").push(task);
    }

    pub fn pop(&self) -> Option<GcTask> {
        let mut tasks = self.tasks.lock().expect("lock poisoned");
        if tasks.is_empty() {
            None
        } else {
            Some(tasks.remove(0))
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for GcQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Dereferenced chunks waiting out their grace period before the bytes are
/// deleted from storage nodes.
pub struct ChunkGcQueue {
    pending: Mutex<Vec<ChunkGcEntry>>,
}

impl ChunkGcQueue {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, entry: ChunkGcEntry) {
        self.pending.lock().expect("lock poisoned").push(entry);
    }

    pub fn extend(&self, entries: impl IntoIterator<Item = ChunkGcEntry>) {
        self.pending.lock().expect("lock poisoned").extend(entries);
    }

    /// Removes and returns the entries whose grace period has ended.
    pub fn drain_ready(&self, now: Timestamp) -> Vec<ChunkGcEntry> {
        let mut pending = self.pending.lock().expect("lock poisoned");
        let (ready, waiting): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|e| e.delete_after <= now);
        *pending = waiting;
        ready
    }

    pub fn len(&self) -> usize {
        self.pending.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChunkGcQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one orphan scan pass.
#[derive(Debug, Default)]
pub struct OrphanScanStats {
    pub known_chunks: usize,
    pub servers_scanned: usize,
    pub orphans_deleted: usize,
}

/// Tunables for the GC pipeline.
#[derive(Clone, Debug)]
pub struct GcConfig {
    /// Children processed per parent per pass before yielding.
    pub batch_size: usize,
    /// Sleep between batches so foreground traffic is not starved.
    pub yield_pause: Duration,
    /// Poll interval of the teardown worker when its queue is empty.
    pub idle_pause: Duration,
    /// Tick interval of the physical-deletion worker.
    pub deletion_tick: Duration,
    /// Sleep between orphan scans.
    pub orphan_scan_interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            batch_size: GC_BATCH_SIZE,
            yield_pause: Duration::from_millis(10),
            idle_pause: Duration::from_millis(500),
            deletion_tick: Duration::from_secs(1),
            orphan_scan_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Drives teardown tasks, physical deletions, and the orphan scan. Runs on
/// the leader; every namespace or chunk-map mutation still goes through a
/// proposed command.
pub struct GcPipeline {
    config: GcConfig,
    store: Arc<MetadataStore>,
    consensus: Arc<dyn ConsensusHandle>,
    chunks: Arc<dyn ChunkTransport>,
    queue: Arc<GcQueue>,
    pending: Arc<ChunkGcQueue>,
    running: std::sync::atomic::AtomicBool,
}

impl GcPipeline {
    pub fn new(
        config: GcConfig,
        store: Arc<MetadataStore>,
        consensus: Arc<dyn ConsensusHandle>,
        chunks: Arc<dyn ChunkTransport>,
        queue: Arc<GcQueue>,
        pending: Arc<ChunkGcQueue>,
    ) -> Self {
        Self {
            config,
            store,
            consensus,
            chunks,
            queue,
            pending,
            running: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Spawns the three pipeline workers: teardown, physical deletion, and
    /// the orphan scan. Only the leader proposes, so followers' workers
    /// idle on NotLeader errors until a failover.
    pub fn start(self: &Arc<Self>) {
        use std::sync::atomic::Ordering;

        let gc = self.clone();
        tokio::spawn(async move {
            while gc.running.load(Ordering::SeqCst) {
                match gc.process_next().await {
                    Ok(true) => {}
                    Ok(false) => tokio::time::sleep(gc.config.idle_pause).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "teardown worker error");
                        tokio::time::sleep(gc.config.idle_pause).await;
                    }
                }
            }
        });

        let gc = self.clone();
        tokio::spawn(async move {
            while gc.running.load(Ordering::SeqCst) {
                gc.run_physical_deletions(Timestamp::now()).await;
                tokio::time::sleep(gc.config.deletion_tick).await;
            }
        });

        let gc = self.clone();
        tokio::spawn(async move {
            while gc.running.load(Ordering::SeqCst) {
                tokio::time::sleep(gc.config.orphan_scan_interval).await;
                match gc.run_orphan_scan().await {
                    Ok(stats) => tracing::info!(
                        known = stats.known_chunks,
                        servers = stats.servers_scanned,
                        deleted = stats.orphans_deleted,
                        "orphan scan complete"
                    ),
                    Err(e) => tracing::warn!(error = %e, "orphan scan failed"),
                }
            }
        });
    }

    pub fn stop(&self) {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    /// Processes one queued teardown task. Returns false when the queue was
    /// empty. A failed task is re-queued and retried on a later pass.
    pub async fn process_next(&self) -> Result<bool, MetaError> {
        let task = match self.queue.pop() {
            Some(task) => task,
            None => return Ok(false),
        };

        let result = match &task {
            GcTask::Inode { inode } => self.teardown_inode(*inode).await,
            GcTask::Subtree { inode } => self.teardown_subtree(*inode).await,
        };

        if let Err(e) = result {
            tracing::warn!(?task, error = %e, "gc task failed, re-queueing");
            self.queue.push(task);
            return Err(e);
        }
        Ok(true)
    }

    /// Drains the task queue completely.
    pub async fn drain(&self) -> Result<usize, MetaError> {
        let mut processed = 0;
        while self.process_next().await? {
            processed += 1;
        }
        Ok(processed)
    }

    async fn teardown_inode(&self, inode: InodeId) -> Result<(), MetaError> {
        // The cascade in the apply path releases chunk references and feeds
        // zero-reference chunks into the pending queue via the applier.
        self.consensus
            .propose(Command::DeleteInode { inode_id: inode })
            .await?;
        Ok(())
    }

    async fn teardown_subtree(&self, dir: InodeId) -> Result<(), MetaError> {
        loop {
            let children = self.store.list_children(dir)?;
            if children.is_empty() {
                break;
            }
            let more = children.len() > self.config.batch_size;

            for (name, child_id) in children.into_iter().take(self.config.batch_size) {
                self.consensus
                    .propose(Command::RemoveChild {
                        parent: dir,
                        name,
                    })
                    .await?;

                match self.store.get_inode(child_id)? {
                    Some(child) if child.is_directory() => {
                        self.queue.push(GcTask::Subtree { inode: child_id });
                    }
                    Some(_) => {
                        self.consensus
                            .propose(Command::DeleteInode { inode_id: child_id })
                            .await?;
                    }
                    None => {}
                }
            }

            if more {
                tokio::time::sleep(self.config.yield_pause).await;
            }
        }

        self.consensus
            .propose(Command::DeleteInode { inode_id: dir })
            .await?;
        tracing::debug!(inode = %dir, "subtree teardown complete");
        Ok(())
    }

    /// Deletes the bytes of every chunk whose grace period has ended.
    /// Failed deletes are only logged; the orphan scan is the backstop.
    pub async fn run_physical_deletions(&self, now: Timestamp) -> usize {
        let ready = self.pending.drain_ready(now);
        for entry in &ready {
            for server in &entry.servers {
                if let Err(e) = self.chunks.delete_chunk(server, &entry.chunk_id).await {
                    tracing::warn!(
                        chunk = %entry.chunk_id,
                        server = %server,
                        error = %e,
                        "physical chunk delete failed"
                    );
                }
            }
        }
        if !ready.is_empty() {
            tracing::info!(count = ready.len(), "physically deleted chunks");
        }
        ready.len()
    }

    /// Diffs every ONLINE server's inventory against the metadata and
    /// deletes chunks the metadata does not know. Chunks allocated to live
    /// upload sessions count as known so an in-flight upload is spared.
    pub async fn run_orphan_scan(&self) -> Result<OrphanScanStats, MetaError> {
        let mut known: HashSet<ChunkId> = self
            .store
            .scan_all_chunks()?
            .into_iter()
            .map(|c| c.chunk_id)
            .collect();

        let now = Timestamp::now();
        for session in self.store.list_sessions()? {
            if !session.is_expired(now) {
                known.extend(session.chunks.into_iter().map(|a| a.chunk_id));
            }
        }

        let mut stats = OrphanScanStats {
            known_chunks: known.len(),
            ..OrphanScanStats::default()
        };

        for server in self.store.list_servers(Some(ServerStatus::Online))? {
            let inventory = match self.chunks.list_chunks(&server.server_id).await {
                Ok(inventory) => inventory,
                Err(e) => {
                    tracing::warn!(server = %server.server_id, error = %e, "orphan scan: inventory failed");
                    continue;
                }
            };
            stats.servers_scanned += 1;

            for chunk_id in inventory {
                if known.contains(&chunk_id) {
                    continue;
                }
                tracing::info!(chunk = %chunk_id, server = %server.server_id, "deleting orphan chunk");
                match self.chunks.delete_chunk(&server.server_id, &chunk_id).await {
                    Ok(()) => stats.orphans_deleted += 1,
                    Err(e) => {
                        tracing::warn!(chunk = %chunk_id, server = %server.server_id, error = %e, "orphan delete failed");
                    }
                }
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{bootstrap_store, DirectConsensus, FakeChunkNet};
    use crate::types::{
        ChunkMeta, ChunkServerInfo, Inode, InodeStatus, ServerId, UploadId, UploadSession,
        UploadStatus,
    };
    use bytes::Bytes;

    struct Fixture {
        store: Arc<MetadataStore>,
        consensus: Arc<DirectConsensus>,
        net: Arc<FakeChunkNet>,
        queue: Arc<GcQueue>,
        pending: Arc<ChunkGcQueue>,
        pipeline: GcPipeline,
    }

    fn fixture() -> Fixture {
        fixture_with_batch(GC_BATCH_SIZE)
    }

    fn fixture_with_batch(batch_size: usize) -> Fixture {
        let store = bootstrap_store();
        let consensus = Arc::new(DirectConsensus::new(store.clone()));
        let net = Arc::new(FakeChunkNet::new());
        let queue = Arc::new(GcQueue::new());
        let pending = Arc::new(ChunkGcQueue::new());
        let pipeline = GcPipeline::new(
            GcConfig {
                batch_size,
                yield_pause: Duration::from_millis(0),
                ..GcConfig::default()
            },
            store.clone(),
            consensus.clone(),
            net.clone(),
            queue.clone(),
            pending.clone(),
        );
        Fixture {
            store,
            consensus,
            net,
            queue,
            pending,
            pipeline,
        }
    }

    async fn create_file(fx: &Fixture, id: u64, parent: u64, name: &str, chunk: &str) {
        let mut inode = Inode::new_uploading_file(
            InodeId::new(id),
            InodeId::new(parent),
            name,
            8,
            1,
            "tester",
        );
        inode.status = InodeStatus::Active;
        fx.consensus
            .propose(Command::CreateInode { inode })
            .await
            .unwrap();
        fx.consensus
            .propose(Command::AddChild {
                parent: InodeId::new(parent),
                name: name.to_string(),
                child: InodeId::new(id),
            })
            .await
            .unwrap();
        fx.consensus
            .propose(Command::PutChunk {
                chunk: ChunkMeta {
                    chunk_id: ChunkId::new(chunk),
                    inode_id: InodeId::new(id),
                    version: 1,
                    chunk_index: 0,
                    size: 8,
                    checksum: "00".repeat(32),
                    servers: vec![ServerId::new("s0")],
                },
            })
            .await
            .unwrap();
    }

    async fn create_dir(fx: &Fixture, id: u64, parent: u64, name: &str) {
        let inode = Inode::new_directory(InodeId::new(id), InodeId::new(parent), name, "tester");
        fx.consensus
            .propose(Command::CreateInode { inode })
            .await
            .unwrap();
        fx.consensus
            .propose(Command::AddChild {
                parent: InodeId::new(parent),
                name: name.to_string(),
                child: InodeId::new(id),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_subtree_teardown_walks_everything() {
        let fx = fixture();
        // /x/y with two files under /x/y.
        create_dir(&fx, 2, 1, "x").await;
        create_dir(&fx, 3, 2, "y").await;
        create_file(&fx, 4, 3, "f1", "c-f1").await;
        create_file(&fx, 5, 3, "f2", "c-f2").await;

        // Foreground detach of /x, then the background walk.
        fx.consensus
            .propose(Command::RemoveChild {
                parent: InodeId::ROOT,
                name: "x".to_string(),
            })
            .await
            .unwrap();
        fx.queue.push(GcTask::Subtree {
            inode: InodeId::new(2),
        });
        fx.pipeline.drain().await.unwrap();

        for id in 2..=5 {
            assert!(fx.store.get_inode(InodeId::new(id)).unwrap().is_none());
        }
        assert_eq!(fx.store.get_chunk_ref(&ChunkId::new("c-f1")).unwrap(), 0);

        // Both file chunks were released into the grace-period queue.
        let released = fx.consensus.released.lock().unwrap();
        assert_eq!(released.len(), 2);
        let now = Timestamp::now();
        for entry in released.iter() {
            assert!(entry.delete_after > now);
        }
    }

    #[tokio::test]
    async fn test_subtree_teardown_batches_large_directories() {
        let fx = fixture_with_batch(3);
        create_dir(&fx, 2, 1, "big").await;
        for i in 0..8u64 {
            create_file(&fx, 10 + i, 2, &format!("f{}", i), &format!("c{}", i)).await;
        }

        fx.queue.push(GcTask::Subtree {
            inode: InodeId::new(2),
        });
        fx.pipeline.drain().await.unwrap();

        assert!(fx.store.get_inode(InodeId::new(2)).unwrap().is_none());
        assert!(fx.store.list_children(InodeId::new(2)).unwrap().is_empty());
        assert_eq!(fx.consensus.released.lock().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_physical_deletion_waits_for_grace_period() {
        let fx = fixture();
        fx.net.seed(&ServerId::new("s0"), "doomed", Bytes::from_static(b"x"), "cs");

        let now = Timestamp::from_secs(1000);
        fx.pending.push(ChunkGcEntry {
            chunk_id: ChunkId::new("doomed"),
            servers: vec![ServerId::new("s0")],
            delete_after: now.plus(Duration::from_secs(60)),
        });

        // Still inside the grace period: nothing happens.
        assert_eq!(fx.pipeline.run_physical_deletions(now).await, 0);
        assert_eq!(fx.pending.len(), 1);

        // Past the grace period: the delete RPC goes out.
        let later = now.plus(Duration::from_secs(61));
        assert_eq!(fx.pipeline.run_physical_deletions(later).await, 1);
        assert!(fx.pending.is_empty());
        assert_eq!(
            fx.net.deleted.lock().unwrap().as_slice(),
            &[(ServerId::new("s0"), ChunkId::new("doomed"))]
        );
    }

    #[tokio::test]
    async fn test_orphan_scan_spares_known_and_session_chunks() {
        let fx = fixture();
        create_file(&fx, 2, 1, "f", "known").await;

        let server = ServerId::new("s0");
        fx.store
            .put_server(&ChunkServerInfo {
                server_id: server.clone(),
                address: "127.0.0.1:7000".to_string(),
                capacity: 1 << 30,
                used: 0,
                chunk_count: 3,
                zone: "z0".to_string(),
                status: crate::types::ServerStatus::Online,
                last_heartbeat: Timestamp::now(),
            })
            .unwrap();

        // A live session protects its allocated chunk ids.
        let now = Timestamp::now();
        fx.store
            .put_session(&UploadSession {
                upload_id: UploadId::new("u1"),
                inode_id: InodeId::new(9),
                version: 1,
                chunks: vec![crate::types::ChunkAllocation {
                    chunk_index: 0,
                    chunk_id: ChunkId::new("in-flight"),
                    servers: vec![server.clone()],
                }],
                status: UploadStatus::Pending,
                created_at: now,
                expires_at: now.plus(Duration::from_secs(3600)),
                prior: None,
            })
            .unwrap();

        fx.net.seed(&server, "known", Bytes::from_static(b"k"), "cs");
        fx.net.seed(&server, "in-flight", Bytes::from_static(b"i"), "cs");
        fx.net.seed(&server, "orphan", Bytes::from_static(b"o"), "cs");

        let stats = fx.pipeline.run_orphan_scan().await.unwrap();
        assert_eq!(stats.servers_scanned, 1);
        assert_eq!(stats.orphans_deleted, 1);

        let deleted = fx.net.deleted.lock().unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].1, ChunkId::new("orphan"));
    }

    #[tokio::test]
    async fn test_process_next_on_empty_queue() {
        let fx = fixture();
        assert!(!fx.pipeline.process_next().await.unwrap());
    }
}
