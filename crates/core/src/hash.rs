//! Content-addressed cache key generation.

use sha2::{Digest, Sha256};

use crate::genkey::GenKey;

/// Compute the storage key for the result of `sql` under a generation key.
///
/// The lineage id and version are part of the digest, so any invalidation of
/// the generation key moves the result to a fresh storage key.
pub fn compute_cache_key(gen_key: &GenKey, sql: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(gen_key.name.as_bytes());
    hasher.update(b"\n");
    hasher.update(gen_key.unique_id.as_bytes());
    hasher.update(b"\n");
    hasher.update(gen_key.version.to_be_bytes());
    hasher.update(b"\n");
    hasher.update(sql.as_bytes());
    hex::encode(hasher.finalize())
}
