//! chunkfs metadata plane: Raft-replicated namespace, chunk map, upload
//! sessions, storage-node registry, and the GC/repair pipelines.

/// The apply path: committed commands become metadata state
pub mod apply;
/// Sans-IO Raft consensus core
pub mod consensus;
/// Lazy teardown, grace-period chunk deletion, orphan scan
pub mod gc;
/// Embedded key-value persistence substrate
pub mod kvstore;
/// Node runtime: timers, replication fan-out, applier
pub mod node;
/// Zone-aware replica placement
pub mod placement;
/// Persistent Raft hard state and log entries
pub mod raft_log;
/// Linearizable read bookkeeping (ReadIndex)
pub mod readindex;
/// Under-replication repair
pub mod repair;
/// Transport trait seams between the planes
pub mod rpc;
/// Namespace, session, and registry operations
pub mod service;
/// Typed accessors over the metadata keyspace
pub mod store;
/// Core types, constants, and the error taxonomy
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use types::*;
