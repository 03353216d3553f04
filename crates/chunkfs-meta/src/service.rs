//! The metadata service: namespace operations, upload sessions, and the
//! storage-node registry, all on top of the replicated log.
//!
//! Every mutation of the namespace or chunk map is proposed as a command and
//! observed only after commit and apply. Reads pass the read-index barrier
//! first, then traverse the store directly. Per-parent-directory locks keep
//! two clients from racing a resolve→propose critical section for siblings
//! of the same name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::gc::{GcQueue, GcTask};
use crate::placement::select_servers;
use crate::rpc::{MetaControl, MetadataApi, RpcError};
use crate::store::MetadataStore;
use crate::types::{
    ChunkAllocation, ChunkId, ChunkIssueKind, ChunkMeta, ChunkServerInfo, Command, Heartbeat,
    Inode, InodeId, InodeStatus, LogIndex, MetaError, NodeId, ServerId, ServerStatus, Timestamp,
    UploadId, UploadSession, UploadStatus, CHUNK_SIZE, REPLICATION_FACTOR, SERVER_TIMEOUT,
    UPLOAD_SESSION_TTL,
};

/// What the service needs from the consensus runtime.
#[async_trait]
pub trait ConsensusHandle: Send + Sync {
    /// Proposes a command; returns its log index once committed AND applied.
    async fn propose(&self, command: Command) -> Result<LogIndex, MetaError>;

    /// Linearizable read barrier: returns once the local state machine
    /// reflects every write committed before this call.
    async fn read_index(&self) -> Result<(), MetaError>;

    fn is_leader(&self) -> bool;

    fn leader_hint(&self) -> Option<NodeId>;
}

/// Tunables for the metadata service. Defaults match production; tests
/// shrink `chunk_size` so multi-chunk files stay small.
#[derive(Clone, Debug)]
pub struct MetadataServiceConfig {
    pub chunk_size: u64,
    pub replication_factor: usize,
    pub session_ttl: Duration,
    pub server_timeout: Duration,
    /// How often the heartbeat monitor looks for silent servers.
    pub stale_check_interval: Duration,
    /// How often expired upload sessions are swept.
    pub session_sweep_interval: Duration,
    /// Owner recorded on inodes created through this service.
    pub owner: String,
}

impl Default for MetadataServiceConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            replication_factor: REPLICATION_FACTOR,
            session_ttl: UPLOAD_SESSION_TTL,
            server_timeout: SERVER_TIMEOUT,
            stale_check_interval: Duration::from_secs(5),
            session_sweep_interval: Duration::from_secs(60),
            owner: "root".to_string(),
        }
    }
}

/// Splits a slash-separated path into its components. Empty segments
/// (leading, trailing, doubled slashes) are dropped; "/" is the empty path.
pub fn parse_path(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

pub struct MetadataService {
    config: MetadataServiceConfig,
    consensus: Arc<dyn ConsensusHandle>,
    store: Arc<MetadataStore>,
    gc: Arc<GcQueue>,
    dir_locks: DashMap<InodeId, Arc<tokio::sync::Mutex<()>>>,
    running: std::sync::atomic::AtomicBool,
}

impl MetadataService {
    pub fn new(
        config: MetadataServiceConfig,
        consensus: Arc<dyn ConsensusHandle>,
        store: Arc<MetadataStore>,
        gc: Arc<GcQueue>,
    ) -> Self {
        Self {
            config,
            consensus,
            store,
            gc,
            dir_locks: DashMap::new(),
            running: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn store(&self) -> &Arc<MetadataStore> {
        &self.store
    }

    /// Spawns the leader-side maintenance loops: the heartbeat-timeout
    /// monitor (which kicks `replicator` when servers drop OFFLINE) and the
    /// expired-session sweeper.
    pub fn start_maintenance(
        self: &Arc<Self>,
        replicator: Option<Arc<crate::repair::Replicator>>,
    ) {
        use std::sync::atomic::Ordering;

        let svc = self.clone();
        tokio::spawn(async move {
            while svc.running.load(Ordering::SeqCst) {
                tokio::time::sleep(svc.config.stale_check_interval).await;
                if !svc.consensus.is_leader() {
                    continue;
                }
                match svc.mark_stale_servers(Timestamp::now()) {
                    Ok(stale) if !stale.is_empty() => {
                        if let Some(replicator) = &replicator {
                            replicator.kick();
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "stale-server check failed"),
                }
            }
        });

        let svc = self.clone();
        tokio::spawn(async move {
            while svc.running.load(Ordering::SeqCst) {
                tokio::time::sleep(svc.config.session_sweep_interval).await;
                if !svc.consensus.is_leader() {
                    continue;
                }
                if let Err(e) = svc.sweep_expired_sessions(Timestamp::now()).await {
                    tracing::warn!(error = %e, "session sweep failed");
                }
            }
        });
    }

    pub fn stop_maintenance(&self) {
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
    }

    fn ensure_leader(&self) -> Result<(), MetaError> {
        if self.consensus.is_leader() {
            Ok(())
        } else {
            Err(MetaError::NotLeader {
                leader_hint: self.consensus.leader_hint(),
            })
        }
    }

    fn parent_lock(&self, parent: InodeId) -> Arc<tokio::sync::Mutex<()>> {
        self.dir_locks
            .entry(parent)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Walks the tree from the root. Only ACTIVE inodes resolve; UPLOADING
    /// and DELETED ones read as absent.
    fn walk(&self, parts: &[&str]) -> Result<Option<Inode>, MetaError> {
        let mut current = match self.store.get_inode(InodeId::ROOT)? {
            Some(inode) => inode,
            None => return Ok(None),
        };
        for part in parts {
            let child_id = match self.store.get_child(current.id, part)? {
                Some(id) => id,
                None => return Ok(None),
            };
            let child = match self.store.get_inode(child_id)? {
                Some(inode) => inode,
                None => return Ok(None),
            };
            if child.status != InodeStatus::Active {
                return Ok(None);
            }
            current = child;
        }
        Ok(Some(current))
    }

    fn lookup(&self, path: &str) -> Result<Option<Inode>, MetaError> {
        self.walk(&parse_path(path))
    }

    /// Resolves a path's parent directory and leaf name.
    fn lookup_parent(&self, path: &str) -> Result<(Inode, String), MetaError> {
        let parts = parse_path(path);
        let (name, prefix) = match parts.split_last() {
            Some((name, prefix)) => (*name, prefix),
            None => return Err(MetaError::ParentNotFound(path.to_string())),
        };
        let parent = self
            .walk(prefix)?
            .ok_or_else(|| MetaError::ParentNotFound(path.to_string()))?;
        if !parent.is_directory() {
            return Err(MetaError::NotADirectory(path.to_string()));
        }
        Ok((parent, name.to_string()))
    }

    /// Updates the registry from a storage-node heartbeat. Any heartbeat
    /// brings a node back ONLINE unless it is administratively DRAINING.
    pub fn handle_heartbeat(&self, hb: Heartbeat) -> Result<(), MetaError> {
        let status = match self.store.get_server(&hb.server_id)? {
            Some(existing) if existing.status == ServerStatus::Draining => ServerStatus::Draining,
            _ => ServerStatus::Online,
        };
        self.store.put_server(&ChunkServerInfo {
            server_id: hb.server_id,
            address: hb.address,
            capacity: hb.capacity,
            used: hb.used,
            chunk_count: hb.chunk_count,
            zone: hb.zone,
            status,
            last_heartbeat: Timestamp::now(),
        })
    }

    /// Reclassifies ONLINE servers with no recent heartbeat as OFFLINE.
    /// Returns the servers that just went offline (a repair trigger).
    pub fn mark_stale_servers(&self, now: Timestamp) -> Result<Vec<ServerId>, MetaError> {
        let timeout = self.config.server_timeout.as_secs();
        let mut stale = Vec::new();
        for mut server in self.store.list_servers(Some(ServerStatus::Online))? {
            if server.last_heartbeat.secs_until(now) > timeout {
                tracing::warn!(server = %server.server_id, "no heartbeat, marking OFFLINE");
                server.status = ServerStatus::Offline;
                self.store.put_server(&server)?;
                stale.push(server.server_id);
            }
        }
        Ok(stale)
    }

    /// Records a scrub finding: the reporting server no longer holds the
    /// chunk, so every row listing it sheds that replica. The repair loop
    /// restores the count afterwards.
    pub async fn handle_chunk_issue(
        &self,
        server_id: &ServerId,
        chunk_id: &ChunkId,
        kind: ChunkIssueKind,
    ) -> Result<(), MetaError> {
        self.ensure_leader()?;
        tracing::warn!(server = %server_id, chunk = %chunk_id, ?kind, "chunk issue reported");
        for mut chunk in self.store.scan_all_chunks()? {
            if &chunk.chunk_id == chunk_id && chunk.servers.contains(server_id) {
                chunk.servers.retain(|s| s != server_id);
                self.consensus
                    .propose(Command::PutChunk { chunk })
                    .await?;
            }
        }
        Ok(())
    }

    pub fn list_servers(
        &self,
        status: Option<ServerStatus>,
    ) -> Result<Vec<ChunkServerInfo>, MetaError> {
        self.store.list_servers(status)
    }

    /// Aborts every session past its expiry. Driven periodically by the
    /// node runtime on the leader.
    pub async fn sweep_expired_sessions(&self, now: Timestamp) -> Result<usize, MetaError> {
        let expired = self.store.list_expired_sessions(now)?;
        let count = expired.len();
        for session in expired {
            tracing::info!(upload = %session.upload_id, "aborting expired upload session");
            self.abort_session(session).await?;
        }
        Ok(count)
    }

    /// Tears down a session: a brand-new file loses its inode and edge, an
    /// overwrite gets its prior ACTIVE record proposed back. Chunks already
    /// written by the session become orphans for the scan.
    async fn abort_session(&self, session: UploadSession) -> Result<(), MetaError> {
        if let Some(inode) = self.store.get_inode(session.inode_id)? {
            if inode.status == InodeStatus::Uploading && inode.version == session.version {
                match &session.prior {
                    Some(prior) => {
                        self.consensus
                            .propose(Command::CreateInode {
                                inode: prior.clone(),
                            })
                            .await?;
                    }
                    None => {
                        self.consensus
                            .propose(Command::RemoveChild {
                                parent: inode.parent,
                                name: inode.name.clone(),
                            })
                            .await?;
                        self.consensus
                            .propose(Command::DeleteInode { inode_id: inode.id })
                            .await?;
                    }
                }
            }
        }
        self.store.delete_session(&session.upload_id)
    }

    fn allocate_chunks(&self, num_chunks: u64) -> Result<Vec<ChunkAllocation>, MetaError> {
        let online = self.store.list_servers(Some(ServerStatus::Online))?;
        let mut chunks = Vec::with_capacity(num_chunks as usize);
        for index in 0..num_chunks {
            let servers = select_servers(&online, self.config.replication_factor);
            chunks.push(ChunkAllocation {
                chunk_index: index as u32,
                chunk_id: ChunkId::generate(),
                servers,
            });
        }
        Ok(chunks)
    }
}

#[async_trait]
impl MetadataApi for MetadataService {
    async fn create_directory(&self, path: &str) -> Result<Inode, MetaError> {
        self.ensure_leader()?;
        let (parent, name) = self.lookup_parent(path)?;

        let lock = self.parent_lock(parent.id);
        let _guard = lock.lock().await;

        if self.store.get_child(parent.id, &name)?.is_some() {
            return Err(MetaError::AlreadyExists(path.to_string()));
        }

        let inode = Inode::new_directory(
            self.store.allocate_inode_id()?,
            parent.id,
            name.clone(),
            self.config.owner.clone(),
        );
        self.consensus
            .propose(Command::CreateInode {
                inode: inode.clone(),
            })
            .await?;
        self.consensus
            .propose(Command::AddChild {
                parent: parent.id,
                name,
                child: inode.id,
            })
            .await?;

        tracing::info!(path, inode = %inode.id, "created directory");
        Ok(inode)
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<Inode>, MetaError> {
        self.consensus.read_index().await?;

        let inode = self
            .lookup(path)?
            .ok_or_else(|| MetaError::NotFound(path.to_string()))?;
        if !inode.is_directory() {
            return Err(MetaError::NotADirectory(path.to_string()));
        }

        let mut entries = Vec::new();
        for (_, child_id) in self.store.list_children(inode.id)? {
            if let Some(child) = self.store.get_inode(child_id)? {
                if child.status == InodeStatus::Active {
                    entries.push(child);
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<(), MetaError> {
        self.ensure_leader()?;
        let (parent, name) = self.lookup_parent(path)?;

        let lock = self.parent_lock(parent.id);
        let _guard = lock.lock().await;

        let inode = self
            .lookup(path)?
            .ok_or_else(|| MetaError::NotFound(path.to_string()))?;

        if inode.is_directory() && !self.store.list_children(inode.id)?.is_empty() {
            return Err(MetaError::DirectoryNotEmpty(path.to_string()));
        }

        let mut tombstone = inode.clone();
        tombstone.status = InodeStatus::Deleted;
        tombstone.modified_at = Timestamp::now();
        self.consensus
            .propose(Command::CreateInode { inode: tombstone })
            .await?;
        self.consensus
            .propose(Command::RemoveChild {
                parent: parent.id,
                name,
            })
            .await?;

        self.gc.push(GcTask::Inode { inode: inode.id });
        tracing::info!(path, inode = %inode.id, "deleted");
        Ok(())
    }

    async fn delete_recursive(&self, path: &str) -> Result<(), MetaError> {
        self.ensure_leader()?;
        let (parent, name) = self.lookup_parent(path)?;

        let lock = self.parent_lock(parent.id);
        let _guard = lock.lock().await;

        let inode = self
            .lookup(path)?
            .ok_or_else(|| MetaError::NotFound(path.to_string()))?;

        let mut tombstone = inode.clone();
        tombstone.status = InodeStatus::Deleted;
        tombstone.modified_at = Timestamp::now();
        self.consensus
            .propose(Command::CreateInode { inode: tombstone })
            .await?;
        self.consensus
            .propose(Command::RemoveChild {
                parent: parent.id,
                name,
            })
            .await?;

        // The subtree walk happens off the request path.
        let task = if inode.is_directory() {
            GcTask::Subtree { inode: inode.id }
        } else {
            GcTask::Inode { inode: inode.id }
        };
        self.gc.push(task);
        tracing::info!(path, inode = %inode.id, "deleted recursively");
        Ok(())
    }

    async fn resolve_path(&self, path: &str) -> Result<Option<Inode>, MetaError> {
        self.consensus.read_index().await?;
        self.lookup(path)
    }

    async fn init_upload(&self, path: &str, size: u64) -> Result<UploadSession, MetaError> {
        self.ensure_leader()?;
        let (parent, name) = self.lookup_parent(path)?;

        let lock = self.parent_lock(parent.id);
        let _guard = lock.lock().await;

        let existing = match self.store.get_child(parent.id, &name)? {
            Some(child_id) => self.store.get_inode(child_id)?,
            None => None,
        };

        let (inode_id, version, prior, is_new) = match existing {
            Some(existing) => {
                if !existing.is_file() {
                    return Err(MetaError::NotAFile(path.to_string()));
                }
                let prior = (existing.status == InodeStatus::Active).then(|| existing.clone());
                (existing.id, existing.version + 1, prior, false)
            }
            None => (self.store.allocate_inode_id()?, 1, None, true),
        };

        let num_chunks = std::cmp::max(1, size.div_ceil(self.config.chunk_size));
        let chunks = self.allocate_chunks(num_chunks)?;

        let inode = Inode::new_uploading_file(
            inode_id,
            parent.id,
            name.clone(),
            size,
            version,
            self.config.owner.clone(),
        );
        self.consensus
            .propose(Command::CreateInode {
                inode: inode.clone(),
            })
            .await?;
        if is_new {
            self.consensus
                .propose(Command::AddChild {
                    parent: parent.id,
                    name,
                    child: inode_id,
                })
                .await?;
        }

        let now = Timestamp::now();
        let session = UploadSession {
            upload_id: UploadId::generate(),
            inode_id,
            version,
            chunks,
            status: UploadStatus::Pending,
            created_at: now,
            expires_at: now.plus(self.config.session_ttl),
            prior,
        };
        self.store.put_session(&session)?;

        tracing::info!(
            path,
            upload = %session.upload_id,
            version,
            chunks = session.chunks.len(),
            "upload session opened"
        );
        Ok(session)
    }

    async fn commit_upload(
        &self,
        upload_id: &UploadId,
        checksums: Vec<String>,
    ) -> Result<Inode, MetaError> {
        self.ensure_leader()?;
        let session = self
            .store
            .get_session(upload_id)?
            .ok_or_else(|| MetaError::UploadNotFound(upload_id.clone()))?;

        if session.is_expired(Timestamp::now()) {
            self.abort_session(session).await?;
            return Err(MetaError::InvalidUpload(format!(
                "session {} expired",
                upload_id
            )));
        }
        if checksums.len() != session.chunks.len() {
            return Err(MetaError::InvalidUpload(format!(
                "expected {} chunk checksums, got {}",
                session.chunks.len(),
                checksums.len()
            )));
        }

        let mut inode = self
            .store
            .get_inode(session.inode_id)?
            .ok_or_else(|| MetaError::InvalidUpload("target inode vanished".to_string()))?;

        let last = session.chunks.len() - 1;
        for (i, allocation) in session.chunks.iter().enumerate() {
            let size = if i == last {
                inode.size - i as u64 * self.config.chunk_size
            } else {
                self.config.chunk_size
            };
            self.consensus
                .propose(Command::PutChunk {
                    chunk: ChunkMeta {
                        chunk_id: allocation.chunk_id.clone(),
                        inode_id: session.inode_id,
                        version: session.version,
                        chunk_index: allocation.chunk_index,
                        size,
                        checksum: checksums[i].clone(),
                        servers: allocation.servers.clone(),
                    },
                })
                .await?;
        }

        inode.status = InodeStatus::Active;
        inode.modified_at = Timestamp::now();
        self.consensus
            .propose(Command::CreateInode {
                inode: inode.clone(),
            })
            .await?;

        self.store.delete_session(upload_id)?;
        tracing::info!(upload = %upload_id, inode = %inode.id, version = inode.version, "upload committed");
        Ok(inode)
    }

    async fn abort_upload(&self, upload_id: &UploadId) -> Result<(), MetaError> {
        self.ensure_leader()?;
        // Unknown session: nothing to do.
        let session = match self.store.get_session(upload_id)? {
            Some(session) => session,
            None => return Ok(()),
        };
        tracing::info!(upload = %upload_id, "aborting upload session");
        self.abort_session(session).await
    }

    async fn get_upload_session(
        &self,
        upload_id: &UploadId,
    ) -> Result<Option<UploadSession>, MetaError> {
        self.consensus.read_index().await?;
        match self.store.get_session(upload_id)? {
            Some(session) if session.is_expired(Timestamp::now()) => {
                self.abort_session(session).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn get_file_metadata(
        &self,
        path: &str,
        version: Option<u64>,
    ) -> Result<(Inode, Vec<ChunkMeta>), MetaError> {
        self.consensus.read_index().await?;

        let inode = self
            .lookup(path)?
            .ok_or_else(|| MetaError::NotFound(path.to_string()))?;
        if !inode.is_file() {
            return Err(MetaError::NotAFile(path.to_string()));
        }

        let version = version.unwrap_or(inode.version);
        let chunks = self.store.get_chunks(inode.id, version)?;
        Ok((inode, chunks))
    }

    async fn get_server(
        &self,
        server_id: &ServerId,
    ) -> Result<Option<ChunkServerInfo>, MetaError> {
        self.store.get_server(server_id)
    }
}

#[async_trait]
impl MetaControl for MetadataService {
    async fn heartbeat(&self, hb: Heartbeat) -> Result<(), RpcError> {
        self.handle_heartbeat(hb)
            .map_err(|e| RpcError::Rejected(e.to_string()))
    }

    async fn report_chunk_issue(
        &self,
        server_id: &ServerId,
        chunk_id: &ChunkId,
        kind: ChunkIssueKind,
    ) -> Result<(), RpcError> {
        self.handle_chunk_issue(server_id, chunk_id, kind)
            .await
            .map_err(|e| RpcError::Rejected(e.to_string()))
    }
}
