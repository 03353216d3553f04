//! The metadata node runtime.
//!
//! Wires the sans-IO consensus core to a transport and drives it: the
//! election timer, the leader heartbeat tick, replication fan-out, and the
//! applier. The applier is the only writer to the metadata state machine;
//! proposals and linearizable reads both block on it through a notify.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::task::JoinSet;

use crate::apply::StateMachine;
use crate::consensus::{RaftConfig, RaftCore};
use crate::gc::ChunkGcQueue;
use crate::kvstore::KvStore;
use crate::raft_log::RaftLogStore;
use crate::readindex::{ReadIndexTracker, ReadStatus};
use crate::rpc::{RaftTransport, RpcError};
use crate::service::ConsensusHandle;
use crate::store::MetadataStore;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, Command, Inode, InodeId, LogIndex, MetaError,
    NodeId, Term, VoteRequest, VoteResponse, ELECTION_TIMEOUT_MAX_MS, ELECTION_TIMEOUT_MIN_MS,
    GC_GRACE_PERIOD, LEADER_HEARTBEAT_INTERVAL,
};

/// Per-RPC deadline for consensus traffic.
const RPC_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a proposal or read waits for the applier before giving up.
const APPLY_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Replication rounds attempted per proposal before reporting failure.
const MAX_REPLICATION_ROUNDS: usize = 8;

/// Configuration for a metadata node.
pub struct MetaNodeConfig {
    pub node_id: NodeId,
    pub peers: Vec<NodeId>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval: Duration,
    /// Grace period applied to chunks released by teardowns.
    pub grace_period: Duration,
}

impl Default for MetaNodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(1),
            peers: Vec::new(),
            election_timeout_min_ms: ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max_ms: ELECTION_TIMEOUT_MAX_MS,
            heartbeat_interval: LEADER_HEARTBEAT_INTERVAL,
            grace_period: GC_GRACE_PERIOD,
        }
    }
}

/// One metadata node: consensus runtime plus the applied state machine.
pub struct MetaNode {
    config: MetaNodeConfig,
    raft: Mutex<RaftCore>,
    store: Arc<MetadataStore>,
    sm: StateMachine,
    transport: Arc<dyn RaftTransport>,
    reads: ReadIndexTracker,
    released: Arc<ChunkGcQueue>,
    apply_lock: Mutex<()>,
    applied: AtomicU64,
    apply_notify: tokio::sync::Notify,
    propose_lock: tokio::sync::Mutex<()>,
    last_contact: Mutex<Instant>,
    running: AtomicBool,
}

impl MetaNode {
    /// Builds a node over the given KV store and transport. The root
    /// directory is bootstrapped on first start; every replica writes the
    /// identical record, so this stays deterministic.
    pub fn new(
        config: MetaNodeConfig,
        kv: Arc<dyn KvStore>,
        transport: Arc<dyn RaftTransport>,
    ) -> Result<Arc<Self>, MetaError> {
        let store = Arc::new(MetadataStore::open(kv.clone())?);
        if store.get_inode(InodeId::ROOT)?.is_none() {
            store.put_inode(&Inode::new_directory(
                InodeId::ROOT,
                InodeId::ROOT,
                "/",
                "root",
            ))?;
        }

        let raft = RaftCore::recover(
            RaftConfig {
                node_id: config.node_id,
                peers: config.peers.clone(),
                election_timeout_min_ms: config.election_timeout_min_ms,
                election_timeout_max_ms: config.election_timeout_max_ms,
            },
            RaftLogStore::new(kv),
        )?;

        let sm = StateMachine::new(store.clone()).with_grace_period(config.grace_period);

        Ok(Arc::new(Self {
            config,
            raft: Mutex::new(raft),
            store,
            sm,
            transport,
            reads: ReadIndexTracker::new(),
            released: Arc::new(ChunkGcQueue::new()),
            apply_lock: Mutex::new(()),
            applied: AtomicU64::new(0),
            apply_notify: tokio::sync::Notify::new(),
            propose_lock: tokio::sync::Mutex::new(()),
            last_contact: Mutex::new(Instant::now()),
            running: AtomicBool::new(false),
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn store(&self) -> Arc<MetadataStore> {
        self.store.clone()
    }

    /// Chunks released by applied teardowns, for the GC pipeline.
    pub fn released_chunks(&self) -> Arc<ChunkGcQueue> {
        self.released.clone()
    }

    pub fn current_term(&self) -> Term {
        self.raft.lock().expect("lock poisoned").current_term()
    }

    /// Starts the background tasks. A node with no peers elects itself
    /// immediately so single-node deployments serve without a vote round.
    pub fn start(self: &Arc<Self>) -> Result<(), MetaError> {
        self.running.store(true, Ordering::SeqCst);
        if self.config.peers.is_empty() {
            let mut raft = self.raft.lock().expect("lock poisoned");
            raft.start_election()?;
        }

        let node = self.clone();
        tokio::spawn(async move { node.election_loop().await });
        let node = self.clone();
        tokio::spawn(async move { node.heartbeat_loop().await });
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    // ── inbound consensus RPCs ──────────────────────────────────────────

    /// Handles a RequestVote from a candidate.
    pub fn handle_vote(&self, req: &VoteRequest) -> Result<VoteResponse, MetaError> {
        let resp = {
            let mut raft = self.raft.lock().expect("lock poisoned");
            raft.handle_vote_request(req)?
        };
        if resp.vote_granted {
            self.touch_contact();
        }
        Ok(resp)
    }

    /// Handles an AppendEntries from a leader; doubles as the heartbeat
    /// receiver. Newly committed entries are applied before returning.
    pub fn handle_append(&self, req: &AppendEntriesRequest) -> Result<AppendEntriesResponse, MetaError> {
        let resp = {
            let mut raft = self.raft.lock().expect("lock poisoned");
            raft.handle_append_request(req)?
        };
        if resp.term == req.term {
            self.touch_contact();
        }
        self.drain_applies()?;
        Ok(resp)
    }

    // ── applier ─────────────────────────────────────────────────────────

    /// Applies every committed-but-unapplied entry, in log order. Serialized
    /// by `apply_lock`: this is the sole writer to the state machine.
    fn drain_applies(&self) -> Result<(), MetaError> {
        let _guard = self.apply_lock.lock().expect("lock poisoned");
        let entries = {
            let mut raft = self.raft.lock().expect("lock poisoned");
            raft.take_committed()
        };
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            let outcome = self.sm.apply(&entry.command)?;
            self.released.extend(outcome.released);
            self.applied.store(entry.index.as_u64(), Ordering::SeqCst);
        }
        self.apply_notify.notify_waiters();
        Ok(())
    }

    async fn wait_for_applied(&self, index: LogIndex) -> Result<(), MetaError> {
        let deadline = Instant::now() + APPLY_WAIT_TIMEOUT;
        loop {
            let notified = self.apply_notify.notified();
            if self.applied.load(Ordering::SeqCst) >= index.as_u64() {
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MetaError::Timeout(format!(
                    "state machine did not reach index {}",
                    index
                )));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    // ── replication fan-out ─────────────────────────────────────────────

    async fn broadcast_append(
        &self,
        requests: Vec<(NodeId, AppendEntriesRequest)>,
    ) -> Vec<(NodeId, AppendEntriesResponse)> {
        let mut set = JoinSet::new();
        for (peer, req) in requests {
            let transport = self.transport.clone();
            set.spawn(async move {
                let resp = tokio::time::timeout(RPC_TIMEOUT, transport.append_entries(peer, req))
                    .await
                    .map_err(|_| RpcError::Timeout(peer.to_string()))
                    .and_then(|r| r);
                (peer, resp)
            });
        }

        let mut responses = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((peer, Ok(resp))) => responses.push((peer, resp)),
                Ok((peer, Err(e))) => {
                    tracing::debug!(peer = %peer, error = %e, "append entries failed");
                }
                Err(e) => tracing::debug!(error = %e, "append task panicked"),
            }
        }
        responses
    }

    /// One replication round to every peer: send each its pending entries
    /// (or an empty heartbeat), feed the responses back, apply anything
    /// newly committed.
    pub async fn replicate_once(&self) -> Result<(), MetaError> {
        let requests = {
            let raft = self.raft.lock().expect("lock poisoned");
            if !raft.is_leader() {
                return Ok(());
            }
            raft.peers()
                .iter()
                .map(|p| (*p, raft.append_request_for(*p)))
                .collect::<Vec<_>>()
        };
        let responses = self.broadcast_append(requests).await;
        {
            let mut raft = self.raft.lock().expect("lock poisoned");
            for (peer, resp) in &responses {
                raft.handle_append_response(*peer, resp)?;
            }
        }
        self.drain_applies()
    }

    // ── elections ───────────────────────────────────────────────────────

    /// Runs one election round. Public so embedders and tests can force a
    /// campaign instead of waiting out the randomized timeout.
    pub async fn campaign(&self) -> Result<bool, MetaError> {
        let (req, peers) = {
            let mut raft = self.raft.lock().expect("lock poisoned");
            let req = raft.start_election()?;
            if raft.is_leader() {
                return Ok(true);
            }
            (req, raft.peers().to_vec())
        };

        let mut set = JoinSet::new();
        for peer in peers {
            let transport = self.transport.clone();
            let req = req.clone();
            set.spawn(async move {
                let resp = tokio::time::timeout(RPC_TIMEOUT, transport.request_vote(peer, req))
                    .await
                    .map_err(|_| RpcError::Timeout(peer.to_string()))
                    .and_then(|r| r);
                (peer, resp)
            });
        }

        let mut won = false;
        while let Some(joined) = set.join_next().await {
            let (peer, resp) = match joined {
                Ok((peer, Ok(resp))) => (peer, resp),
                Ok((peer, Err(e))) => {
                    tracing::debug!(peer = %peer, error = %e, "vote request failed");
                    continue;
                }
                Err(_) => continue,
            };
            let became_leader = {
                let mut raft = self.raft.lock().expect("lock poisoned");
                raft.record_vote(peer, &resp)?
            };
            if became_leader {
                won = true;
                break;
            }
        }

        if won {
            // Assert leadership before a follower times out again.
            self.replicate_once().await?;
        }
        Ok(won)
    }

    fn touch_contact(&self) {
        *self.last_contact.lock().expect("lock poisoned") = Instant::now();
    }

    fn random_timeout(&self) -> Duration {
        let ms = rand::thread_rng()
            .gen_range(self.config.election_timeout_min_ms..=self.config.election_timeout_max_ms);
        Duration::from_millis(ms)
    }

    async fn election_loop(self: Arc<Self>) {
        let mut timeout = self.random_timeout();
        loop {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if self.raft.lock().expect("lock poisoned").is_leader() {
                continue;
            }
            let elapsed = self.last_contact.lock().expect("lock poisoned").elapsed();
            if elapsed >= timeout {
                if let Err(e) = self.campaign().await {
                    tracing::warn!(error = %e, "election round failed");
                }
                self.touch_contact();
                timeout = self.random_timeout();
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            if self.raft.lock().expect("lock poisoned").is_leader() {
                if let Err(e) = self.replicate_once().await {
                    tracing::warn!(error = %e, "heartbeat round failed");
                }
            }
        }
    }
}

#[async_trait]
impl ConsensusHandle for MetaNode {
    /// Proposes a command and returns once it is committed AND applied
    /// locally. No caller observes an acknowledged command's effects before
    /// this returns.
    async fn propose(&self, command: Command) -> Result<LogIndex, MetaError> {
        let _guard = self.propose_lock.lock().await;

        let index = {
            let mut raft = self.raft.lock().expect("lock poisoned");
            raft.append_command(command)?
        };

        // Single-node clusters commit on append.
        self.drain_applies()?;
        if self.applied.load(Ordering::SeqCst) >= index.as_u64() {
            return Ok(index);
        }

        for _ in 0..MAX_REPLICATION_ROUNDS {
            let requests = {
                let raft = self.raft.lock().expect("lock poisoned");
                if !raft.is_leader() {
                    return Err(MetaError::NotLeader {
                        leader_hint: raft.leader_hint(),
                    });
                }
                raft.peers()
                    .iter()
                    .map(|p| (*p, raft.append_request_for(*p)))
                    .collect::<Vec<_>>()
            };
            let responses = self.broadcast_append(requests).await;
            {
                let mut raft = self.raft.lock().expect("lock poisoned");
                for (peer, resp) in &responses {
                    raft.handle_append_response(*peer, resp)?;
                }
            }
            self.drain_applies()?;
            if self.applied.load(Ordering::SeqCst) >= index.as_u64() {
                return Ok(index);
            }
        }

        Err(MetaError::ProposalFailed(format!(
            "entry {} did not reach a majority",
            index
        )))
    }

    /// Linearizable read barrier. Confirms leadership with an empty
    /// AppendEntries round, then waits for the applier to reach the commit
    /// index observed at entry.
    async fn read_index(&self) -> Result<(), MetaError> {
        self.drain_applies()?;

        let (read_index, peers, term) = {
            let raft = self.raft.lock().expect("lock poisoned");
            if !raft.is_leader() {
                return Err(MetaError::NotLeader {
                    leader_hint: raft.leader_hint(),
                });
            }
            (raft.commit_index(), raft.peers().to_vec(), raft.current_term())
        };

        if !peers.is_empty() {
            let read_id = self.reads.register(read_index, peers.len() + 1);
            let requests = {
                let raft = self.raft.lock().expect("lock poisoned");
                peers
                    .iter()
                    .map(|p| (*p, raft.append_request_for(*p)))
                    .collect::<Vec<_>>()
            };
            let responses = self.broadcast_append(requests).await;
            {
                let mut raft = self.raft.lock().expect("lock poisoned");
                for (peer, resp) in &responses {
                    raft.handle_append_response(*peer, resp)?;
                }
            }
            for (peer, resp) in &responses {
                // Any reply at our term (even a log-mismatch rejection)
                // acknowledges our leadership.
                if resp.term <= term {
                    self.reads.confirm(read_id, *peer)?;
                }
            }

            let status = self
                .reads
                .status(read_id, LogIndex::new(self.applied.load(Ordering::SeqCst)))?;
            self.reads.complete(read_id);
            if status == ReadStatus::WaitingForQuorum {
                let hint = self.raft.lock().expect("lock poisoned").leader_hint();
                return Err(MetaError::NotLeader { leader_hint: hint });
            }
            self.drain_applies()?;
        }

        self.wait_for_applied(read_index).await
    }

    fn is_leader(&self) -> bool {
        self.raft.lock().expect("lock poisoned").is_leader()
    }

    fn leader_hint(&self) -> Option<NodeId> {
        self.raft.lock().expect("lock poisoned").leader_hint()
    }
}

/// In-process consensus transport: routes messages straight to the target
/// node's handlers. Backs single-process deployments and the test clusters;
/// supports symmetric partitions for failure testing.
pub struct InProcessRaftNet {
    nodes: dashmap::DashMap<NodeId, Arc<MetaNode>>,
    partitioned: Mutex<std::collections::HashSet<NodeId>>,
}

impl InProcessRaftNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: dashmap::DashMap::new(),
            partitioned: Mutex::new(std::collections::HashSet::new()),
        })
    }

    pub fn register(&self, node: Arc<MetaNode>) {
        self.nodes.insert(node.node_id(), node);
    }

    /// Cuts a node off: traffic to and from it fails until healed.
    pub fn partition(&self, node: NodeId) {
        self.partitioned.lock().expect("lock poisoned").insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.partitioned
            .lock()
            .expect("lock poisoned")
            .remove(&node);
    }

    fn check_link(&self, from: NodeId, to: NodeId) -> Result<(), RpcError> {
        let partitioned = self.partitioned.lock().expect("lock poisoned");
        if partitioned.contains(&from) || partitioned.contains(&to) {
            return Err(RpcError::Unavailable(format!("{} -> {}", from, to)));
        }
        Ok(())
    }

    /// The transport handle node `from` should send through.
    pub fn handle_for(self: &Arc<Self>, from: NodeId) -> Arc<dyn RaftTransport> {
        Arc::new(NetHandle {
            net: self.clone(),
            from,
        })
    }
}

struct NetHandle {
    net: Arc<InProcessRaftNet>,
    from: NodeId,
}

#[async_trait]
impl RaftTransport for NetHandle {
    async fn request_vote(
        &self,
        peer: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, RpcError> {
        self.net.check_link(self.from, peer)?;
        let node = self
            .net
            .nodes
            .get(&peer)
            .ok_or_else(|| RpcError::Unavailable(peer.to_string()))?
            .clone();
        node.handle_vote(&req)
            .map_err(|e| RpcError::Rejected(e.to_string()))
    }

    async fn append_entries(
        &self,
        peer: NodeId,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RpcError> {
        self.net.check_link(self.from, peer)?;
        let node = self
            .net
            .nodes
            .get(&peer)
            .ok_or_else(|| RpcError::Unavailable(peer.to_string()))?
            .clone();
        node.handle_append(&req)
            .map_err(|e| RpcError::Rejected(e.to_string()))
    }
}
