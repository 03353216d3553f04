//! chunkfs client SDK: namespace operations, two-phase resumable uploads,
//! and checksum-verified downloads with replica fail-over.

/// The client itself
pub mod client;
/// Client-side error types
pub mod error;
/// Resumable upload state persistence
pub mod state;

pub use client::{Client, ClientConfig};
pub use error::{ClientError, ClientResult};
pub use state::UploadState;
