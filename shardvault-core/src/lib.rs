//! Shardvault Core - content-addressed image object store
//!
//! Objects are addressed by a hash of their bytes and laid out on disk as
//! `<base>/<hash[0:2]>/<hash[2:4]>/<sequence>.<ext>`:
//! - xxh64 primary hash (16 hex chars) plus a SHA-1 secondary hash
//! - per-shard sequence numbers from an atomic counter
//! - SQLite for the authoritative object index and provenance
//! - JSON sidecars regenerated from the index

pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod operations;
pub mod storage;

pub use config::{AllocationConfig, VaultConfig};
pub use engine::StorageEngine;
pub use error::{Result, VaultError};
pub use model::{ImageFormat, NewObject, ObjectAddress, StoredObject, object_filename};
pub use operations::{
    DuplicateContent, ObjectLookup, PutObjectOperation, PutObjectOperationOutcome,
    PutObjectOperationRequest, PutObjectOperationResult, ReadObjectOperation,
    ReadObjectOperationOutcome, ReadObjectOperationRequest, ReadObjectOperationResult,
    ReconcileOperation, ReconcileOperationRequest, ReconcileOperationResult, UpdateTagsOperation,
    UpdateTagsOperationOutcome, UpdateTagsOperationRequest, UpdateTagsOperationResult,
    WriteState,
};
pub use storage::{
    BlobStore, ContentDigest, CounterStore, DuplicateIndex, DuplicateLookup, HashKind,
    MemoryCounterStore, MetadataStore, NewProvenance, ProvenanceRecord, ProvenanceTracker,
    SearchQuery, SequenceAllocator, ShardKey, SidecarDocument, SqliteCounterStore,
    Transformation, compute_digest, resolve_shard,
};
