//! Sans-IO Raft core for the replicated metadata log.
//!
//! The core owns role, term, vote, and log state; it consumes request and
//! response structs and produces responses, never touching the network. The
//! node runtime drives it: timers, fan-out, and the apply loop live in
//! [`crate::node`]. Term, vote, and log mutations are persisted through
//! [`RaftLogStore`] before any message that depends on them is handed back
//! to the caller.

use std::collections::{HashMap, HashSet};

use crate::raft_log::RaftLogStore;
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, Command, LogEntry, LogIndex, MetaError, NodeId,
    RaftRole, Term, VoteRequest, VoteResponse,
};

/// Static configuration of one consensus group member.
pub struct RaftConfig {
    /// This node's identifier.
    pub node_id: NodeId,
    /// The other members of the group.
    pub peers: Vec<NodeId>,
    /// Minimum randomized election timeout in milliseconds.
    pub election_timeout_min_ms: u64,
    /// Maximum randomized election timeout in milliseconds.
    pub election_timeout_max_ms: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(1),
            peers: Vec::new(),
            election_timeout_min_ms: crate::types::ELECTION_TIMEOUT_MIN_MS,
            election_timeout_max_ms: crate::types::ELECTION_TIMEOUT_MAX_MS,
        }
    }
}

/// The consensus state machine for one node.
pub struct RaftCore {
    config: RaftConfig,
    store: RaftLogStore,
    role: RaftRole,
    current_term: Term,
    voted_for: Option<NodeId>,
    leader_id: Option<NodeId>,
    log: Vec<LogEntry>,
    commit_index: LogIndex,
    last_applied: LogIndex,
    next_index: HashMap<NodeId, LogIndex>,
    match_index: HashMap<NodeId, LogIndex>,
    votes_received: HashSet<NodeId>,
}

impl RaftCore {
    /// Rebuilds the core from persisted state. Fresh stores yield a follower
    /// at term zero with an empty log.
    pub fn recover(config: RaftConfig, store: RaftLogStore) -> Result<Self, MetaError> {
        let current_term = store.load_term()?;
        let voted_for = store.load_voted_for()?;
        let log = store.load_all()?;
        tracing::info!(
            node_id = %config.node_id,
            term = %current_term,
            log_len = log.len(),
            "recovered raft state"
        );
        Ok(Self {
            config,
            store,
            role: RaftRole::Follower,
            current_term,
            voted_for,
            leader_id: None,
            log,
            commit_index: LogIndex::ZERO,
            last_applied: LogIndex::ZERO,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.config.node_id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.config.peers
    }

    pub fn role(&self) -> RaftRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == RaftRole::Leader
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// The node currently believed to be leader, if any. Used as the
    /// redirect hint in `NotLeader` errors.
    pub fn leader_hint(&self) -> Option<NodeId> {
        self.leader_id
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn last_log_index(&self) -> LogIndex {
        LogIndex::new(self.log.len() as u64)
    }

    pub fn last_log_term(&self) -> Term {
        self.log.last().map(|e| e.term).unwrap_or(Term::ZERO)
    }

    /// The entry at a 1-based log index.
    pub fn entry(&self, index: LogIndex) -> Option<&LogEntry> {
        let i = index.as_u64() as usize;
        if i == 0 {
            None
        } else {
            self.log.get(i - 1)
        }
    }

    fn majority(&self) -> usize {
        (self.config.peers.len() + 1) / 2 + 1
    }

    /// Starts a new election: become candidate, bump the term, vote for self.
    /// Returns the vote request to broadcast. A cluster with no peers wins
    /// immediately and transitions straight to leader.
    pub fn start_election(&mut self) -> Result<VoteRequest, MetaError> {
        self.current_term = self.current_term.next();
        self.role = RaftRole::Candidate;
        self.voted_for = Some(self.config.node_id);
        self.leader_id = None;
        self.store.save_term(self.current_term)?;
        self.store.save_voted_for(self.voted_for)?;

        self.votes_received.clear();
        self.votes_received.insert(self.config.node_id);

        tracing::info!(
            node_id = %self.config.node_id,
            term = %self.current_term,
            "starting election"
        );

        if self.votes_received.len() >= self.majority() {
            self.become_leader();
        }

        Ok(VoteRequest {
            term: self.current_term,
            candidate_id: self.config.node_id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        })
    }

    /// Handles an incoming RequestVote.
    pub fn handle_vote_request(&mut self, req: &VoteRequest) -> Result<VoteResponse, MetaError> {
        if req.term > self.current_term {
            self.step_down(req.term)?;
        }

        let grant = if req.term < self.current_term {
            false
        } else if let Some(voted) = self.voted_for {
            voted == req.candidate_id
        } else {
            self.log_up_to_date(req.last_log_index, req.last_log_term)
        };

        if grant && self.voted_for.is_none() {
            self.voted_for = Some(req.candidate_id);
            self.store.save_voted_for(self.voted_for)?;
        }

        tracing::debug!(
            node_id = %self.config.node_id,
            candidate = %req.candidate_id,
            term = %req.term,
            granted = grant,
            "handled vote request"
        );

        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: grant,
        })
    }

    /// Records a vote response. Returns true if this vote completed a
    /// majority and the node just became leader.
    pub fn record_vote(&mut self, from: NodeId, resp: &VoteResponse) -> Result<bool, MetaError> {
        if resp.term > self.current_term {
            self.step_down(resp.term)?;
            return Ok(false);
        }
        if self.role != RaftRole::Candidate {
            return Ok(false);
        }
        if resp.vote_granted {
            self.votes_received.insert(from);
        }
        if self.votes_received.len() >= self.majority() {
            self.become_leader();
            return Ok(true);
        }
        Ok(false)
    }

    fn become_leader(&mut self) {
        tracing::info!(
            node_id = %self.config.node_id,
            term = %self.current_term,
            "won election, becoming leader"
        );
        self.role = RaftRole::Leader;
        self.leader_id = Some(self.config.node_id);
        let next = LogIndex::new(self.last_log_index().as_u64() + 1);
        for peer in &self.config.peers {
            self.next_index.insert(*peer, next);
            self.match_index.insert(*peer, LogIndex::ZERO);
        }
    }

    /// Appends a command to the leader's log under the current term and
    /// persists it. Returns the entry's index. In a single-node cluster the
    /// entry commits immediately.
    pub fn append_command(&mut self, command: Command) -> Result<LogIndex, MetaError> {
        if self.role != RaftRole::Leader {
            return Err(MetaError::NotLeader {
                leader_hint: self.leader_id,
            });
        }
        let index = LogIndex::new(self.log.len() as u64 + 1);
        let entry = LogEntry {
            term: self.current_term,
            index,
            command,
        };
        self.store.append_entries(std::slice::from_ref(&entry))?;
        self.log.push(entry);

        tracing::debug!(
            node_id = %self.config.node_id,
            term = %self.current_term,
            index = %index,
            "appended proposal"
        );

        self.advance_commit();
        Ok(index)
    }

    /// Builds the AppendEntries request for one peer, carrying every entry
    /// from that peer's `next_index` onward. With nothing pending this is
    /// the empty heartbeat.
    pub fn append_request_for(&self, peer: NodeId) -> AppendEntriesRequest {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(LogIndex::new(self.log.len() as u64 + 1));
        let prev_log_index = LogIndex::new(next.as_u64().saturating_sub(1));
        let prev_log_term = self
            .entry(prev_log_index)
            .map(|e| e.term)
            .unwrap_or(Term::ZERO);
        let entries = if next.as_u64() as usize <= self.log.len() {
            self.log[next.as_u64() as usize - 1..].to_vec()
        } else {
            Vec::new()
        };
        AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.config.node_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }
    }

    /// Handles an incoming AppendEntries (follower/candidate side).
    pub fn handle_append_request(
        &mut self,
        req: &AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, MetaError> {
        if req.term > self.current_term {
            self.step_down(req.term)?;
        }

        if req.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                match_index: self.last_log_index(),
            });
        }

        // Valid leader for this term.
        self.role = RaftRole::Follower;
        self.leader_id = Some(req.leader_id);

        if req.prev_log_index > LogIndex::ZERO {
            match self.entry(req.prev_log_index) {
                Some(e) if e.term == req.prev_log_term => {}
                Some(_) => {
                    // Conflicting suffix: drop it and let the leader back up.
                    let keep = req.prev_log_index.as_u64() as usize - 1;
                    self.log.truncate(keep);
                    self.store.truncate_from(req.prev_log_index)?;
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        match_index: self.last_log_index(),
                    });
                }
                None => {
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        match_index: self.last_log_index(),
                    });
                }
            }
        }

        for entry in &req.entries {
            let pos = entry.index.as_u64() as usize;
            if pos <= self.log.len() {
                if self.log[pos - 1].term != entry.term {
                    self.log.truncate(pos - 1);
                    self.store.truncate_from(entry.index)?;
                    self.store.append_entries(std::slice::from_ref(entry))?;
                    self.log.push(entry.clone());
                }
            } else {
                self.store.append_entries(std::slice::from_ref(entry))?;
                self.log.push(entry.clone());
            }
        }

        if req.leader_commit > self.commit_index {
            self.commit_index = std::cmp::min(req.leader_commit, self.last_log_index());
        }

        Ok(AppendEntriesResponse {
            term: self.current_term,
            success: true,
            match_index: self.last_log_index(),
        })
    }

    /// Handles an AppendEntries response on the leader, updating replication
    /// progress and advancing the commit index on majority.
    pub fn handle_append_response(
        &mut self,
        from: NodeId,
        resp: &AppendEntriesResponse,
    ) -> Result<(), MetaError> {
        if resp.term > self.current_term {
            self.step_down(resp.term)?;
            return Ok(());
        }
        if self.role != RaftRole::Leader {
            return Ok(());
        }

        if resp.success {
            self.next_index
                .insert(from, LogIndex::new(resp.match_index.as_u64() + 1));
            self.match_index.insert(from, resp.match_index);
        } else if let Some(next) = self.next_index.get(&from).copied() {
            let backed = LogIndex::new(next.as_u64().saturating_sub(1).max(1));
            self.next_index.insert(from, backed);
            tracing::debug!(
                node_id = %self.config.node_id,
                peer = %from,
                next_index = %backed,
                "follower rejected append, backing up"
            );
        }

        self.advance_commit();
        Ok(())
    }

    /// Advances the commit index to the highest entry replicated on a
    /// majority. Only entries from the current term commit by counting;
    /// older entries commit transitively with them.
    pub fn advance_commit(&mut self) {
        if self.role != RaftRole::Leader {
            return;
        }
        let last = self.last_log_index().as_u64();
        for n in (self.commit_index.as_u64() + 1)..=last {
            let index = LogIndex::new(n);
            if self.entry(index).map(|e| e.term) != Some(self.current_term) {
                continue;
            }
            let mut replicas = 1;
            for peer in &self.config.peers {
                if self.match_index.get(peer).is_some_and(|m| *m >= index) {
                    replicas += 1;
                }
            }
            if replicas >= self.majority() {
                self.commit_index = index;
            }
        }
    }

    /// Hands back the committed-but-unapplied entries and marks them
    /// applied. The caller must apply them, in order, before observing
    /// any state derived from them.
    pub fn take_committed(&mut self) -> Vec<LogEntry> {
        let start = self.last_applied.as_u64() as usize;
        let end = self.commit_index.as_u64() as usize;
        if start >= end || end > self.log.len() {
            return Vec::new();
        }
        self.last_applied = self.commit_index;
        self.log[start..end].to_vec()
    }

    fn step_down(&mut self, term: Term) -> Result<(), MetaError> {
        tracing::info!(
            node_id = %self.config.node_id,
            old_term = %self.current_term,
            new_term = %term,
            "observed higher term, stepping down"
        );
        self.current_term = term;
        self.role = RaftRole::Follower;
        self.voted_for = None;
        self.leader_id = None;
        self.store.save_term(term)?;
        self.store.save_voted_for(None)?;
        Ok(())
    }

    /// Whether a candidate's log is at least as up-to-date as ours:
    /// lexicographic compare on (last term, last index).
    fn log_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        let my_term = self.last_log_term();
        last_log_term > my_term
            || (last_log_term == my_term && last_log_index >= self.last_log_index())
    }
}
