//! Storage modules for Shardvault
//!
//! Provides content hashing, shard resolution, sequence counters, blob files,
//! the relational metadata index and sidecar documents.

pub mod blob_store;
pub mod counter_store;
pub mod digest;
pub mod duplicate_index;
pub mod metadata_store;
pub mod provenance;
pub mod shard;
pub mod sidecar;

pub use blob_store::{BlobStore, ScannedFile};
pub use counter_store::{CounterStore, MemoryCounterStore, SequenceAllocator, SqliteCounterStore};
pub use digest::{
    ContentDigest, HashKind, compute_digest, compute_primary_hash, compute_secondary_hash,
    verify_primary_hash,
};
pub use duplicate_index::{DuplicateIndex, DuplicateLookup};
pub use metadata_store::{DEFAULT_SEARCH_LIMIT, MetadataStore, SearchQuery};
pub use provenance::{NewProvenance, ProvenanceRecord, ProvenanceTracker, Transformation};
pub use shard::{ShardKey, resolve_shard};
pub use sidecar::{
    SidecarDocument, WrittenSidecar, build_sidecar, load_sidecar_document, regenerate_sidecar,
    render_sidecar,
};
