//! Two-level directory sharding from a primary hash prefix.
//!
//! `hash[0:2]` / `hash[2:4]` bounds the tree at 256 x 256 leaf directories,
//! the same layout git uses for loose objects.

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardKey {
    pub shard1: String,
    pub shard2: String,
}

impl ShardKey {
    pub fn new(shard1: impl Into<String>, shard2: impl Into<String>) -> Self {
        Self {
            shard1: shard1.into(),
            shard2: shard2.into(),
        }
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.shard1, self.shard2)
    }
}

pub fn resolve_shard(primary_hash: &str) -> Result<ShardKey> {
    if primary_hash.len() < 4 {
        return Err(VaultError::InvalidHash(format!(
            "hash too short: {:?}",
            primary_hash
        )));
    }

    let prefix = &primary_hash.as_bytes()[..4];
    if !prefix.iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(VaultError::InvalidHash(format!(
            "non-hex shard prefix: {:?}",
            primary_hash
        )));
    }

    let prefix = primary_hash[..4].to_ascii_lowercase();
    Ok(ShardKey::new(&prefix[0..2], &prefix[2..4]))
}

/// Whether a directory name can be a shard level (two lowercase hex chars).
pub fn is_shard_component(name: &str) -> bool {
    name.len() == 2
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
