//! Content hashing for audit records.

use sha2::{Digest, Sha256};

/// Compute the content hash recorded for a committed value.
///
/// The key is folded in, length-prefixed, so identical text under two keys
/// stays distinguishable in the audit trail and no split of one string into
/// key and value collides with another.
pub fn content_hash(key: &str, value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update((key.len() as u64).to_be_bytes());
    hasher.update(key.as_bytes());
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
