use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use xxhash_rust::xxh64::xxh64;

/// Hex width of the xxh64 primary address.
pub const PRIMARY_HASH_LEN: usize = 16;
pub const SECONDARY_HASH_LEN: usize = 40;

/// Content fingerprints. Derived from the bytes alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest {
    pub primary: String,
    pub secondary: String,
}

/// Which fingerprint matched during duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashKind {
    Primary,
    Secondary,
}

pub fn compute_digest(data: &[u8]) -> ContentDigest {
    ContentDigest {
        primary: compute_primary_hash(data),
        secondary: compute_secondary_hash(data),
    }
}

/// xxh64 with seed 0, as big-endian hex.
pub fn compute_primary_hash(data: &[u8]) -> String {
    format!("{:016x}", xxh64(data, 0))
}

/// SHA-1, kept for objects imported before the primary scheme.
pub fn compute_secondary_hash(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

pub fn verify_primary_hash(data: &[u8], expected: &str) -> Result<()> {
    let actual = compute_primary_hash(data);
    if actual != expected {
        return Err(VaultError::HashMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
