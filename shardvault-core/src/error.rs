use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid hash for shard resolution: {0}")]
    InvalidHash(String),

    #[error("sequence conflict on shard {shard}")]
    SequenceConflict { shard: String },

    #[error("sequence allocation failed on shard {shard} after {attempts} attempts")]
    AllocationFailed { shard: String, attempts: u32 },

    #[error("failed to write object bytes to {path}: {source}")]
    BlobWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The bytes at `path` were written but have no committed row.
    #[error("metadata commit failed for {primary_hash} (orphan file {path}): {source}")]
    MetadataCommit {
        path: PathBuf,
        primary_hash: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("failed to write sidecar for object {object_id} at {path}: {source}")]
    SidecarWrite {
        object_id: i64,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("object not found: {0}")]
    ObjectNotFound(i64),

    #[error("source object not found: {0}")]
    SourceNotFound(i64),

    #[error("object {object_id} has no bytes at {path}")]
    BlobMissing { object_id: i64, path: PathBuf },

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;
