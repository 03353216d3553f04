//! The apply path: committed commands become metadata state.
//!
//! Commands are applied in log order by exactly one caller (the applier in
//! [`crate::node`]); nothing else writes the namespace or chunk map. Every
//! command is idempotent with respect to replay (upserts keyed by identity,
//! cascades that no-op once their target is gone), so re-applying a prefix
//! of the log after a restart converges to the same state.

use std::sync::Arc;
use std::time::Duration;

use crate::store::MetadataStore;
use crate::types::{ChunkGcEntry, Command, MetaError, Timestamp, GC_GRACE_PERIOD};

/// Side effects of an applied command that the leader must act on.
#[derive(Debug, Default)]
pub struct ApplyOutcome {
    /// Chunks whose reference count reached zero: due for physical deletion
    /// once their grace period ends.
    pub released: Vec<ChunkGcEntry>,
}

/// Applies committed commands to the metadata store.
pub struct StateMachine {
    store: Arc<MetadataStore>,
    grace_period: Duration,
}

impl StateMachine {
    pub fn new(store: Arc<MetadataStore>) -> Self {
        Self {
            store,
            grace_period: GC_GRACE_PERIOD,
        }
    }

    /// Overrides the physical-deletion grace period (tests shrink it).
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Applies one committed command.
    ///
    /// Panics on a state that contradicts the namespace invariants (an edge
    /// pointing at an inode that never existed): by then the log itself is
    /// inconsistent and continuing would corrupt the tree.
    pub fn apply(&self, command: &Command) -> Result<ApplyOutcome, MetaError> {
        let mut outcome = ApplyOutcome::default();
        match command {
            Command::CreateInode { inode } => {
                self.store.note_inode_id(inode.id)?;
                self.store.put_inode(inode)?;
            }
            Command::DeleteInode { inode_id } => {
                self.teardown_inode(*inode_id, &mut outcome)?;
            }
            Command::AddChild {
                parent,
                name,
                child,
            } => {
                if self.store.get_inode(*child)?.is_none() {
                    panic!(
                        "apply inconsistency: edge ({}, {:?}) -> {} references a missing inode",
                        parent, name, child
                    );
                }
                self.store.add_child(*parent, name, *child)?;
            }
            Command::RemoveChild { parent, name } => {
                self.store.remove_child(*parent, name)?;
            }
            Command::PutChunk { chunk } => {
                let existing =
                    self.store
                        .get_chunk(chunk.inode_id, chunk.version, chunk.chunk_index)?;
                match existing {
                    Some(old) if old.chunk_id == chunk.chunk_id => {
                        // Same chunk, updated row (e.g. widened server set).
                        self.store.put_chunk(chunk)?;
                    }
                    Some(old) => {
                        // The row now references a different chunk; move the
                        // refcount across so replay converges.
                        if self.store.decrement_chunk_ref(&old.chunk_id)? == 0 {
                            outcome.released.push(ChunkGcEntry {
                                chunk_id: old.chunk_id,
                                servers: old.servers,
                                delete_after: Timestamp::now().plus(self.grace_period),
                            });
                        }
                        self.store.put_chunk(chunk)?;
                        self.store.increment_chunk_ref(&chunk.chunk_id)?;
                    }
                    None => {
                        self.store.put_chunk(chunk)?;
                        self.store.increment_chunk_ref(&chunk.chunk_id)?;
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Tears down an inode record: every version's chunk rows release their
    /// references, zero-reference chunks join the physical-deletion queue,
    /// and the record itself is removed. A missing inode is a no-op (replay).
    fn teardown_inode(
        &self,
        inode_id: crate::types::InodeId,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), MetaError> {
        let inode = match self.store.get_inode(inode_id)? {
            Some(inode) => inode,
            None => return Ok(()),
        };

        for version in 1..=inode.version {
            let chunks = self.store.get_chunks(inode_id, version)?;
            for chunk in &chunks {
                if self.store.decrement_chunk_ref(&chunk.chunk_id)? == 0 {
                    outcome.released.push(ChunkGcEntry {
                        chunk_id: chunk.chunk_id.clone(),
                        servers: chunk.servers.clone(),
                        delete_after: Timestamp::now().plus(self.grace_period),
                    });
                }
            }
            if !chunks.is_empty() {
                self.store.delete_chunks(inode_id, version)?;
            }
        }

        self.store.delete_inode(inode_id)?;
        tracing::debug!(inode = %inode_id, "tore down inode");
        Ok(())
    }
}
