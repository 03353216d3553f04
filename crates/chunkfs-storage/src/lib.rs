//! chunkfs storage node: sharded local chunk store with atomic writes,
//! chain replication, heartbeats, and background integrity scrubbing.

/// Request handlers and control loops
pub mod agent;
/// SHA-256 chunk integrity hashing
pub mod checksum;
/// The sharded on-disk chunk store
pub mod chunkstore;
/// Storage-node error types
pub mod error;

pub use agent::{StorageNode, StorageNodeConfig};
pub use chunkstore::{ChunkHealth, ChunkInfo, ChunkStore};
pub use error::{StorageError, StorageResult};
