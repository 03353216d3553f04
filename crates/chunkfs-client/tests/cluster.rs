//! End-to-end tests over an in-process cluster: one (or three) metadata
//! nodes, a fleet of real storage nodes on temp directories, and the client
//! SDK wired through in-memory transports.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::RngCore;
use tempfile::TempDir;

use chunkfs_client::{Client, ClientConfig, UploadState};
use chunkfs_meta::gc::{GcConfig, GcPipeline, GcQueue};
use chunkfs_meta::kvstore::MemoryKvStore;
use chunkfs_meta::node::{InProcessRaftNet, MetaNode, MetaNodeConfig};
use chunkfs_meta::repair::Replicator;
use chunkfs_meta::rpc::{ChunkTransport, MetadataApi, RpcError};
use chunkfs_meta::service::{MetadataService, MetadataServiceConfig};
use chunkfs_meta::types::{
    ChunkId, MetaError, NodeId, ServerId, ServerStatus, Timestamp,
};
use chunkfs_storage::checksum::sha256_hex;
use chunkfs_storage::{StorageNode, StorageNodeConfig};

/// Routes data-channel calls straight to the registered storage agents.
struct DirectChunkNet {
    agents: dashmap::DashMap<ServerId, Arc<StorageNode>>,
}

impl DirectChunkNet {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            agents: dashmap::DashMap::new(),
        })
    }

    fn register(&self, agent: Arc<StorageNode>) {
        self.agents.insert(agent.server_id().clone(), agent);
    }

    fn agent(&self, server: &ServerId) -> Arc<StorageNode> {
        self.agents.get(server).expect("unknown server").clone()
    }
}

#[async_trait]
impl ChunkTransport for DirectChunkNet {
    async fn upload_chunk(
        &self,
        server: &ServerId,
        chunk_id: &ChunkId,
        data: Bytes,
        checksum: &str,
        replicas: &[ServerId],
    ) -> Result<(), RpcError> {
        let agent = self
            .agents
            .get(server)
            .ok_or_else(|| RpcError::Unavailable(server.to_string()))?
            .clone();
        agent
            .handle_upload(chunk_id, data, checksum, replicas)
            .await
            .map_err(|e| RpcError::Rejected(e.to_string()))
    }

    async fn download_chunk(
        &self,
        server: &ServerId,
        chunk_id: &ChunkId,
    ) -> Result<(Bytes, String), RpcError> {
        let agent = self
            .agents
            .get(server)
            .ok_or_else(|| RpcError::Unavailable(server.to_string()))?
            .clone();
        agent
            .handle_download(chunk_id)
            .map_err(|e| RpcError::Rejected(e.to_string()))
    }

    async fn delete_chunk(&self, server: &ServerId, chunk_id: &ChunkId) -> Result<(), RpcError> {
        let agent = self
            .agents
            .get(server)
            .ok_or_else(|| RpcError::Unavailable(server.to_string()))?
            .clone();
        agent
            .handle_delete(chunk_id)
            .map_err(|e| RpcError::Rejected(e.to_string()))
    }

    async fn list_chunks(&self, server: &ServerId) -> Result<Vec<ChunkId>, RpcError> {
        let agent = self
            .agents
            .get(server)
            .ok_or_else(|| RpcError::Unavailable(server.to_string()))?
            .clone();
        Ok(agent.handle_list())
    }
}

/// A chunk transport that starts failing uploads after a budget of
/// successes. Simulates a client killed mid-upload.
struct FlakyChunkNet {
    inner: Arc<DirectChunkNet>,
    budget: AtomicU64,
    uploads: AtomicU64,
}

impl FlakyChunkNet {
    fn new(inner: Arc<DirectChunkNet>, budget: u64) -> Arc<Self> {
        Arc::new(Self {
            inner,
            budget: AtomicU64::new(budget),
            uploads: AtomicU64::new(0),
        })
    }

    fn heal(&self) {
        self.budget.store(u64::MAX, Ordering::SeqCst);
    }

    fn upload_count(&self) -> u64 {
        self.uploads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChunkTransport for FlakyChunkNet {
    async fn upload_chunk(
        &self,
        server: &ServerId,
        chunk_id: &ChunkId,
        data: Bytes,
        checksum: &str,
        replicas: &[ServerId],
    ) -> Result<(), RpcError> {
        if self.uploads.load(Ordering::SeqCst) >= self.budget.load(Ordering::SeqCst) {
            return Err(RpcError::Unavailable("simulated crash".to_string()));
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.inner
            .upload_chunk(server, chunk_id, data, checksum, replicas)
            .await
    }

    async fn download_chunk(
        &self,
        server: &ServerId,
        chunk_id: &ChunkId,
    ) -> Result<(Bytes, String), RpcError> {
        self.inner.download_chunk(server, chunk_id).await
    }

    async fn delete_chunk(&self, server: &ServerId, chunk_id: &ChunkId) -> Result<(), RpcError> {
        self.inner.delete_chunk(server, chunk_id).await
    }

    async fn list_chunks(&self, server: &ServerId) -> Result<Vec<ChunkId>, RpcError> {
        self.inner.list_chunks(server).await
    }
}

struct Harness {
    node: Arc<MetaNode>,
    service: Arc<MetadataService>,
    net: Arc<DirectChunkNet>,
    gc: GcPipeline,
    replicator: Replicator,
    client: Client,
    chunk_size: u64,
    _dirs: Vec<TempDir>,
    _work: TempDir,
}

impl Harness {
    fn local_path(&self, name: &str) -> PathBuf {
        self._work.path().join(name)
    }

    async fn write_random_file(&self, name: &str, size: usize) -> (PathBuf, Vec<u8>) {
        let mut data = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut data);
        let path = self.local_path(name);
        tokio::fs::write(&path, &data).await.unwrap();
        (path, data)
    }
}

async fn harness(chunk_size: u64, num_servers: usize) -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let raft_net = InProcessRaftNet::new();
    let node = MetaNode::new(
        MetaNodeConfig::default(),
        Arc::new(MemoryKvStore::new()),
        raft_net.handle_for(NodeId::new(1)),
    )
    .unwrap();
    raft_net.register(node.clone());
    node.start().unwrap();

    let queue = Arc::new(GcQueue::new());
    let service = Arc::new(MetadataService::new(
        MetadataServiceConfig {
            chunk_size,
            ..MetadataServiceConfig::default()
        },
        node.clone(),
        node.store(),
        queue.clone(),
    ));

    let net = DirectChunkNet::new();
    let mut dirs = Vec::new();
    for i in 0..num_servers {
        let dir = TempDir::new().unwrap();
        let mut config = StorageNodeConfig::new(ServerId::new(format!("s{}", i)), dir.path());
        config.zone = format!("z{}", i);
        config.capacity = 1 << 30;
        config.scrub_pause = Duration::from_millis(0);
        let agent = StorageNode::new(config, net.clone(), service.clone()).unwrap();
        service.handle_heartbeat(agent.heartbeat_payload()).unwrap();
        net.register(agent);
        dirs.push(dir);
    }

    let gc = GcPipeline::new(
        GcConfig {
            yield_pause: Duration::from_millis(0),
            ..GcConfig::default()
        },
        node.store(),
        node.clone(),
        net.clone(),
        queue.clone(),
        node.released_chunks(),
    );
    let replicator = Replicator::new(node.store(), node.clone(), net.clone());

    let client = Client::with_config(
        service.clone(),
        net.clone(),
        ClientConfig {
            chunk_size,
            max_workers: 4,
        },
    );

    Harness {
        node,
        service,
        net,
        gc,
        replicator,
        client,
        chunk_size,
        _dirs: dirs,
        _work: TempDir::new().unwrap(),
    }
}

#[tokio::test]
async fn test_basic_upload_download_round_trip() {
    let h = harness(64 * 1024, 3).await;

    h.client.mkdir("/a").await.unwrap();
    let (path, data) = h.write_random_file("f.bin", 130 * 1024).await;
    h.client.put_parallel(&path, "/a/f").await.unwrap();

    let listing = h.client.ls("/a").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "f");
    assert_eq!(listing[0].size, 130 * 1024);

    // Three dense chunks: two full, one short.
    let (_, chunks) = h.service.get_file_metadata("/a/f", None).await.unwrap();
    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks[0].size, 64 * 1024);
    assert_eq!(chunks[1].size, 64 * 1024);
    assert_eq!(chunks[2].size, 2 * 1024);
    assert_eq!(chunks.iter().map(|c| c.size).sum::<u64>(), 130 * 1024);

    let out = h.local_path("f.out");
    h.client.get_parallel("/a/f", &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
}

#[tokio::test]
async fn test_empty_file_round_trip() {
    let h = harness(8, 3).await;
    let (path, _) = h.write_random_file("empty", 0).await;
    h.client.put(&path, "/empty").await.unwrap();

    let inode = h.client.stat("/empty").await.unwrap();
    assert_eq!(inode.size, 0);

    let (_, chunks) = h.service.get_file_metadata("/empty", None).await.unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].size, 0);

    let out = h.local_path("empty.out");
    h.client.get("/empty", &out).await.unwrap();
    assert!(tokio::fs::read(&out).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_overwrite_bumps_version() {
    let h = harness(8, 3).await;

    let (first, _) = h.write_random_file("v1", 10).await;
    h.client.put(&first, "/f").await.unwrap();
    assert_eq!(h.client.stat("/f").await.unwrap().version, 1);

    let (second, new_data) = h.write_random_file("v2", 20).await;
    h.client.put(&second, "/f").await.unwrap();

    let inode = h.client.stat("/f").await.unwrap();
    assert_eq!(inode.version, 2);
    assert_eq!(inode.size, 20);

    let (_, chunks) = h.service.get_file_metadata("/f", None).await.unwrap();
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.version == 2));

    let out = h.local_path("f.out");
    h.client.get("/f", &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), new_data);
}

#[tokio::test]
async fn test_recursive_delete_feeds_gc() {
    let h = harness(8, 3).await;
    h.client.mkdir("/x").await.unwrap();
    h.client.mkdir("/x/y").await.unwrap();
    h.client.mkdir("/x/y/z").await.unwrap();

    let (f1, _) = h.write_random_file("f1", 16).await;
    let (f2, _) = h.write_random_file("f2", 24).await;
    h.client.put(&f1, "/x/y/f1").await.unwrap();
    h.client.put(&f2, "/x/y/f2").await.unwrap();

    let mut chunk_ids = Vec::new();
    for path in ["/x/y/f1", "/x/y/f2"] {
        let (_, chunks) = h.service.get_file_metadata(path, None).await.unwrap();
        chunk_ids.extend(chunks.into_iter().map(|c| c.chunk_id));
    }
    assert_eq!(chunk_ids.len(), 5);

    // The foreground call detaches immediately; the walk is queued.
    h.client.rm_recursive("/x").await.unwrap();
    assert!(!h.client.exists("/x").await.unwrap());

    h.gc.drain().await.unwrap();

    let store = h.node.store();
    for id in &chunk_ids {
        assert_eq!(store.get_chunk_ref(id).unwrap(), 0);
    }
    assert!(store.scan_all_chunks().unwrap().is_empty());

    // Every released chunk waits out roughly a day of grace.
    let pending = h.node.released_chunks();
    assert_eq!(pending.len(), 5);
    let now = Timestamp::now();
    assert!(pending.drain_ready(now).is_empty());
    let ready = pending.drain_ready(now.plus(Duration::from_secs(25 * 60 * 60)));
    assert_eq!(ready.len(), 5);
    for entry in &ready {
        let delta = now.secs_until(entry.delete_after);
        assert!((23 * 3600..=25 * 3600).contains(&delta), "grace was {}s", delta);
    }
}

#[tokio::test]
async fn test_physical_deletion_after_grace() {
    let h = harness(8, 3).await;
    let (path, _) = h.write_random_file("f", 8).await;
    h.client.put(&path, "/f").await.unwrap();

    let (_, chunks) = h.service.get_file_metadata("/f", None).await.unwrap();
    let chunk = chunks[0].clone();
    for server in &chunk.servers {
        assert!(h.net.agent(server).store().contains(&chunk.chunk_id));
    }

    h.client.rm("/f").await.unwrap();
    h.gc.drain().await.unwrap();

    // Within the grace period the bytes stay put.
    assert_eq!(
        h.gc.run_physical_deletions(Timestamp::now()).await,
        0
    );
    for server in &chunk.servers {
        assert!(h.net.agent(server).store().contains(&chunk.chunk_id));
    }

    let later = Timestamp::now().plus(Duration::from_secs(25 * 60 * 60));
    assert_eq!(h.gc.run_physical_deletions(later).await, 1);
    for server in &chunk.servers {
        assert!(!h.net.agent(server).store().contains(&chunk.chunk_id));
    }
}

#[tokio::test]
async fn test_download_failover_scrub_and_repair() {
    let h = harness(1024 * 1024, 3).await;
    let (path, data) = h.write_random_file("f", 64).await;
    h.client.put(&path, "/f").await.unwrap();

    let (_, chunks) = h.service.get_file_metadata("/f", None).await.unwrap();
    let chunk = chunks[0].clone();
    assert_eq!(chunk.servers.len(), 3);

    // Rot the first replica on disk.
    let victim = chunk.servers[0].clone();
    let victim_agent = h.net.agent(&victim);
    std::fs::write(victim_agent.store().path_of(&chunk.chunk_id), b"garbage").unwrap();

    // The client falls over to a healthy replica.
    let out = h.local_path("f.out");
    h.client.get("/f", &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);

    // Scrub on the victim reports the corruption and deletes the file;
    // the metadata sheds the replica.
    let stats = victim_agent.scrub_pass().await;
    assert_eq!(stats.corrupted, 1);
    assert!(!victim_agent.store().contains(&chunk.chunk_id));

    let (_, chunks) = h.service.get_file_metadata("/f", None).await.unwrap();
    assert_eq!(chunks[0].servers.len(), 2);
    assert!(!chunks[0].servers.contains(&victim));

    // Repair restores the third replica.
    let stats = h.replicator.repair_once().await.unwrap();
    assert_eq!(stats.under_replicated, 1);
    assert_eq!(stats.replicas_added, 1);

    let (_, chunks) = h.service.get_file_metadata("/f", None).await.unwrap();
    assert_eq!(chunks[0].servers.len(), 3);
    assert!(h.net.agent(&victim).store().contains(&chunk.chunk_id));
}

#[tokio::test]
async fn test_resumable_upload_survives_client_crash() {
    let h = harness(8, 3).await;
    let (path, data) = h.write_random_file("f", 32).await;
    let state_path = h.local_path("upload.state");

    // The "crashing" client dies after two of four chunks.
    let flaky = FlakyChunkNet::new(h.net.clone(), 2);
    let crashing = Client::with_config(
        h.service.clone(),
        flaky.clone(),
        ClientConfig {
            chunk_size: h.chunk_size,
            max_workers: 4,
        },
    );
    crashing
        .put_resumable(&path, "/f", &state_path)
        .await
        .unwrap_err();

    let state = UploadState::load(&state_path).unwrap();
    assert_eq!(
        state.completed_chunks.iter().copied().collect::<Vec<_>>(),
        vec![0, 1]
    );

    // The restarted client transfers only the missing indices.
    flaky.heal();
    let restarted = Client::with_config(
        h.service.clone(),
        flaky.clone(),
        ClientConfig {
            chunk_size: h.chunk_size,
            max_workers: 4,
        },
    );
    restarted
        .put_resumable(&path, "/f", &state_path)
        .await
        .unwrap();
    assert_eq!(flaky.upload_count(), 4);
    assert!(!state_path.exists());

    let out = h.local_path("f.out");
    h.client.get("/f", &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), data);
}

#[tokio::test]
async fn test_aborted_upload_leftovers_reclaimed_by_orphan_scan() {
    let h = harness(8, 3).await;

    let session = h.service.init_upload("/f", 8).await.unwrap();
    let allocation = session.chunks[0].clone();

    // The client wrote its chunk (replicated down the chain), then gave up.
    let data = Bytes::from_static(b"12345678");
    let checksum = sha256_hex(&data);
    let (primary, rest) = allocation.servers.split_first().unwrap();
    h.net
        .upload_chunk(primary, &allocation.chunk_id, data, &checksum, rest)
        .await
        .unwrap();
    h.service.abort_upload(&session.upload_id).await.unwrap();
    assert!(!h.client.exists("/f").await.unwrap());

    for server in &allocation.servers {
        assert!(h.net.agent(server).store().contains(&allocation.chunk_id));
    }

    let stats = h.gc.run_orphan_scan().await.unwrap();
    assert_eq!(stats.orphans_deleted, allocation.servers.len());
    for server in &allocation.servers {
        assert!(!h.net.agent(server).store().contains(&allocation.chunk_id));
    }
}

#[tokio::test]
async fn test_orphan_scan_spares_inflight_upload() {
    let h = harness(8, 3).await;

    let session = h.service.init_upload("/f", 8).await.unwrap();
    let allocation = session.chunks[0].clone();
    let data = Bytes::from_static(b"12345678");
    let checksum = sha256_hex(&data);
    let (primary, rest) = allocation.servers.split_first().unwrap();
    h.net
        .upload_chunk(primary, &allocation.chunk_id, data, &checksum, rest)
        .await
        .unwrap();

    // The session is live, so its chunks are not orphans yet.
    let stats = h.gc.run_orphan_scan().await.unwrap();
    assert_eq!(stats.orphans_deleted, 0);
    assert!(h.net.agent(primary).store().contains(&allocation.chunk_id));
}

#[tokio::test]
async fn test_leader_failure_semantics_in_three_node_cluster() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();

    let raft_net = InProcessRaftNet::new();
    let ids: Vec<NodeId> = (1..=3).map(NodeId::new).collect();
    let mut nodes = Vec::new();
    let mut services = Vec::new();
    for id in &ids {
        let node = MetaNode::new(
            MetaNodeConfig {
                node_id: *id,
                peers: ids.iter().copied().filter(|p| p != id).collect(),
                ..MetaNodeConfig::default()
            },
            Arc::new(MemoryKvStore::new()),
            raft_net.handle_for(*id),
        )
        .unwrap();
        raft_net.register(node.clone());
        services.push(Arc::new(MetadataService::new(
            MetadataServiceConfig::default(),
            node.clone(),
            node.store(),
            Arc::new(GcQueue::new()),
        )));
        nodes.push(node);
    }

    assert!(nodes[0].campaign().await.unwrap());

    // Followers redirect writers at the leader.
    let err = services[1].create_directory("/d").await.unwrap_err();
    match err {
        MetaError::NotLeader { leader_hint } => assert_eq!(leader_hint, Some(NodeId::new(1))),
        other => panic!("expected NotLeader, got {other:?}"),
    }

    // A partitioned leader cannot commit; the caller sees a retryable error.
    raft_net.partition(NodeId::new(2));
    raft_net.partition(NodeId::new(3));
    let err = services[0].create_directory("/d").await.unwrap_err();
    assert!(matches!(err, MetaError::ProposalFailed(_)), "got {err:?}");

    // After the partition heals, the retry commits, and exactly one /d
    // exists despite the leftover entry from the failed attempt.
    raft_net.heal(NodeId::new(2));
    raft_net.heal(NodeId::new(3));
    services[0].create_directory("/d").await.unwrap();

    let listing = services[0].list_directory("/").await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "d");
}

#[tokio::test]
async fn test_offline_server_excluded_from_placement() {
    let h = harness(8, 3).await;

    // Silence s2 long enough to time out.
    let stale = h
        .service
        .mark_stale_servers(Timestamp::now().plus(Duration::from_secs(60)))
        .unwrap();
    assert_eq!(stale.len(), 3);

    // Bring two back.
    for i in 0..2 {
        let agent = h.net.agent(&ServerId::new(format!("s{}", i)));
        h.service.handle_heartbeat(agent.heartbeat_payload()).unwrap();
    }
    assert_eq!(
        h.service
            .list_servers(Some(ServerStatus::Online))
            .unwrap()
            .len(),
        2
    );

    let session = h.service.init_upload("/f", 8).await.unwrap();
    assert_eq!(session.chunks[0].servers.len(), 2);
    assert!(!session.chunks[0]
        .servers
        .contains(&ServerId::new("s2")));
}
