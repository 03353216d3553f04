//! Chunk integrity hashing. SHA-256, hex-encoded, end to end: clients hash
//! before upload, storage nodes verify on write and re-verify on scrub,
//! clients verify again on download.

use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `data` hashes to `expected`.
pub fn verify(data: &[u8], expected: &str) -> bool {
    sha256_hex(data) == expected
}
