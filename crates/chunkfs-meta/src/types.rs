use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed chunk size: every chunk of a file except the last is exactly this long.
pub const CHUNK_SIZE: u64 = 64 * 1024 * 1024;

/// Target number of replicas per chunk.
pub const REPLICATION_FACTOR: usize = 3;

/// Interval between storage-node heartbeats.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// A storage node with no heartbeat for this long is reclassified OFFLINE.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(30);

/// Minimum randomized election timeout in milliseconds.
pub const ELECTION_TIMEOUT_MIN_MS: u64 = 150;

/// Maximum randomized election timeout in milliseconds.
pub const ELECTION_TIMEOUT_MAX_MS: u64 = 300;

/// Leader heartbeat tick.
pub const LEADER_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(50);

/// Delay between a chunk becoming dereferenced and its physical deletion.
pub const GC_GRACE_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Upload sessions expire this long after creation.
pub const UPLOAD_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Maximum directory children processed per GC pass before yielding.
pub const GC_BATCH_SIZE: usize = 1000;

/// Unique identifier of a metadata (Raft) node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raft term number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Term(u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn new(t: u64) -> Self {
        Term(t)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Raft log index. Indices are 1-based; zero means "no entry".
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogIndex(u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn new(i: u64) -> Self {
        LogIndex(i)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of an inode in the namespace tree.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeId(u64);

impl InodeId {
    /// The root directory inode (always 1, its own parent).
    pub const ROOT: InodeId = InodeId(1);

    pub fn new(id: u64) -> Self {
        InodeId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a storage node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(String);

impl ServerId {
    pub fn new(id: impl Into<String>) -> Self {
        ServerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a chunk. Minted once at allocation, never reused.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(id: impl Into<String>) -> Self {
        ChunkId(id.into())
    }

    /// Mints a fresh globally-unique chunk id.
    pub fn generate() -> Self {
        ChunkId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an upload session.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UploadId(String);

impl UploadId {
    pub fn new(id: impl Into<String>) -> Self {
        UploadId(id.into())
    }

    pub fn generate() -> Self {
        UploadId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wall-clock instant with second precision. Stored in every persisted record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since the Unix epoch.
    pub secs: u64,
}

impl Timestamp {
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time before epoch");
        Self { secs: now.as_secs() }
    }

    pub fn from_secs(secs: u64) -> Self {
        Self { secs }
    }

    /// This instant shifted forward by `d`.
    pub fn plus(self, d: Duration) -> Self {
        Self {
            secs: self.secs.saturating_add(d.as_secs()),
        }
    }

    /// Seconds elapsed from `self` to `later` (zero if `later` is earlier).
    pub fn secs_until(self, later: Timestamp) -> u64 {
        later.secs.saturating_sub(self.secs)
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs.cmp(&other.secs)
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Kind of a namespace node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    File,
    Directory,
}

/// Lifecycle status of an inode.
///
/// UPLOADING inodes are invisible to listings and path resolution but remain
/// reachable through their open upload session. DELETED inodes are detached
/// tombstones awaiting the GC pipeline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeStatus {
    Uploading,
    Active,
    Deleted,
}

/// A node in the namespace tree: a file or a directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub id: InodeId,
    /// Parent directory; the root is its own parent.
    pub parent: InodeId,
    /// Leaf name under the parent.
    pub name: String,
    pub kind: InodeKind,
    /// Total byte size. Always zero for directories.
    pub size: u64,
    pub status: InodeStatus,
    /// Monotone per-inode version, bumped by one on each successful overwrite.
    pub version: u64,
    pub created_at: Timestamp,
    pub modified_at: Timestamp,
    pub owner: String,
    /// Permission bits; recorded, not enforced.
    pub mode: u32,
}

impl Inode {
    /// Creates an ACTIVE directory inode.
    pub fn new_directory(id: InodeId, parent: InodeId, name: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            parent,
            name: name.into(),
            kind: InodeKind::Directory,
            size: 0,
            status: InodeStatus::Active,
            version: 1,
            created_at: now,
            modified_at: now,
            owner: owner.into(),
            mode: 0o755,
        }
    }

    /// Creates a file inode in UPLOADING state at the given version.
    pub fn new_uploading_file(
        id: InodeId,
        parent: InodeId,
        name: impl Into<String>,
        size: u64,
        version: u64,
        owner: impl Into<String>,
    ) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            parent,
            name: name.into(),
            kind: InodeKind::File,
            size,
            status: InodeStatus::Uploading,
            version,
            created_at: now,
            modified_at: now,
            owner: owner.into(),
            mode: 0o644,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == InodeKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == InodeKind::Directory
    }
}

/// Metadata row for one immutable chunk of a file version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub chunk_id: ChunkId,
    pub inode_id: InodeId,
    pub version: u64,
    /// Dense index within the version, starting at 0.
    pub chunk_index: u32,
    pub size: u64,
    /// Hex-encoded SHA-256 of the chunk bytes.
    pub checksum: String,
    /// Storage nodes believed to hold a replica. Scrub and the orphan scan
    /// are the ground truth; the repair loop reconciles the two.
    pub servers: Vec<ServerId>,
}

/// Availability status of a storage node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Online,
    Offline,
    /// Administratively draining. Sticky: heartbeats do not clear it.
    Draining,
}

/// Registry entry for one storage node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkServerInfo {
    pub server_id: ServerId,
    pub address: String,
    pub capacity: u64,
    pub used: u64,
    pub chunk_count: u64,
    pub zone: String,
    pub status: ServerStatus,
    pub last_heartbeat: Timestamp,
}

impl ChunkServerInfo {
    pub fn available(&self) -> u64 {
        self.capacity.saturating_sub(self.used)
    }
}

/// Heartbeat payload pushed by a storage node to the metadata leader.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub server_id: ServerId,
    pub address: String,
    pub capacity: u64,
    pub used: u64,
    pub chunk_count: u64,
    pub zone: String,
}

/// Scrub finding reported by a storage node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkIssueKind {
    /// The chunk file vanished from local disk.
    Missing,
    /// The chunk file exists but its hash no longer matches.
    Corrupted,
}

/// Pre-allocated placement for one chunk of an upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkAllocation {
    pub chunk_index: u32,
    pub chunk_id: ChunkId,
    /// Replica targets; the first is the primary of the replication chain.
    pub servers: Vec<ServerId>,
}

/// Status of an upload session.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    Pending,
    InProgress,
    Completed,
    Aborted,
}

/// Transient record tracking an in-progress write from `init_upload`
/// until `commit_upload` or `abort_upload`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub upload_id: UploadId,
    pub inode_id: InodeId,
    pub version: u64,
    pub chunks: Vec<ChunkAllocation>,
    pub status: UploadStatus,
    pub created_at: Timestamp,
    pub expires_at: Timestamp,
    /// The previous ACTIVE inode record when this session overwrites an
    /// existing file; proposed back verbatim on abort.
    pub prior: Option<Inode>,
}

impl UploadSession {
    /// An expired session is equivalent to an aborted one.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}

/// Entry in the physical chunk deletion queue. The chunk's bytes are removed
/// from its servers only after `delete_after`, so a racing reader of an
/// older version can still complete.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkGcEntry {
    pub chunk_id: ChunkId,
    pub servers: Vec<ServerId>,
    pub delete_after: Timestamp,
}

/// The closed set of commands replicated through the log. The log is the
/// sole mutation interface to the namespace and chunk map.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Upsert an inode record by id.
    CreateInode { inode: Inode },
    /// Remove an inode record, cascading chunk-row teardown for all its versions.
    DeleteInode { inode_id: InodeId },
    /// Create the directory edge `(parent, name) -> child`.
    AddChild {
        parent: InodeId,
        name: String,
        child: InodeId,
    },
    /// Destroy the directory edge `(parent, name)`.
    RemoveChild { parent: InodeId, name: String },
    /// Upsert the chunk row keyed by `(inode, version, index)`.
    PutChunk { chunk: ChunkMeta },
}

/// One entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub index: LogIndex,
    pub command: Command,
}

/// Role of a node in the consensus group.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// RequestVote RPC.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

/// RequestVote response.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC. With an empty `entries` this doubles as the leader
/// heartbeat and the read-index leadership check.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

/// AppendEntries response. `match_index` is the follower's highest log index
/// known to match the leader's, valid when `success`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub match_index: LogIndex,
}

/// Errors surfaced by the metadata plane.
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// No ACTIVE inode is reachable via the path.
    #[error("not found: {0}")]
    NotFound(String),

    /// An ACTIVE entry with the same name already exists under the parent.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("parent not found for: {0}")]
    ParentNotFound(String),

    #[error("upload session not found: {0}")]
    UploadNotFound(UploadId),

    #[error("invalid upload: {0}")]
    InvalidUpload(String),

    /// Operation requires the consensus leader but this node is not it.
    #[error("not the leader (hint: {leader_hint:?})")]
    NotLeader { leader_hint: Option<NodeId> },

    /// A proposal could not reach a majority. Retryable.
    #[error("proposal failed: {0}")]
    ProposalFailed(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("kv store error: {0}")]
    Kv(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
