use crate::error::{Result, VaultError};
use crate::model::{ImageFormat, NewObject, StoredObject};
use crate::storage::metadata_store::is_unique_violation;
use crate::storage::{
    BlobStore, DuplicateIndex, DuplicateLookup, HashKind, MetadataStore, NewProvenance,
    SequenceAllocator, ShardKey, compute_digest, regenerate_sidecar, resolve_shard,
};
use bytes::Bytes;
use chrono::Utc;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Phases of a single write. Each one is terminal on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Received,
    Hashed,
    Checked,
    Sharded,
    Sequenced,
    Persisted,
    Recorded,
    SidecarWritten,
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteState::Received => "received",
            WriteState::Hashed => "hashed",
            WriteState::Checked => "checked",
            WriteState::Sharded => "sharded",
            WriteState::Sequenced => "sequenced",
            WriteState::Persisted => "persisted",
            WriteState::Recorded => "recorded",
            WriteState::SidecarWritten => "sidecar_written",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct PutObjectOperation {
    blob_store: Arc<BlobStore>,
    metadata: Arc<MetadataStore>,
    duplicates: Arc<DuplicateIndex>,
    allocator: SequenceAllocator,
}

#[derive(Debug, Clone)]
pub struct PutObjectOperationRequest {
    pub body: Bytes,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub tags: String,
    pub extended: BTreeMap<String, String>,
    pub owner_ref: Option<i64>,
    pub provenance: Option<NewProvenance>,
}

impl PutObjectOperationRequest {
    pub fn new(body: impl Into<Bytes>, format: ImageFormat, width: u32, height: u32) -> Self {
        Self {
            body: body.into(),
            format,
            width,
            height,
            tags: String::new(),
            extended: BTreeMap::new(),
            owner_ref: None,
            provenance: None,
        }
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = tags.into();
        self
    }

    pub fn with_provenance(mut self, provenance: NewProvenance) -> Self {
        self.provenance = Some(provenance);
        self
    }
}

#[derive(Debug, Clone)]
pub struct PutObjectOperationResult {
    pub object: StoredObject,
    pub path: PathBuf,
    pub sidecar_path: PathBuf,
}

/// Existing object that already holds the submitted content.
#[derive(Debug, Clone, PartialEq)]
pub struct DuplicateContent {
    pub existing_id: i64,
    pub existing_path: String,
    pub primary_hash: String,
    pub matched_by: HashKind,
}

impl DuplicateContent {
    fn from_object(object: &StoredObject, matched_by: HashKind) -> Self {
        Self {
            existing_id: object.id,
            existing_path: object.relative_path(),
            primary_hash: object.primary_hash.clone(),
            matched_by,
        }
    }
}

#[derive(Debug, Clone)]
pub enum PutObjectOperationOutcome {
    Stored(PutObjectOperationResult),
    Duplicate(DuplicateContent),
}

impl PutObjectOperation {
    pub fn new(
        blob_store: Arc<BlobStore>,
        metadata: Arc<MetadataStore>,
        duplicates: Arc<DuplicateIndex>,
        allocator: SequenceAllocator,
    ) -> Self {
        Self {
            blob_store,
            metadata,
            duplicates,
            allocator,
        }
    }

    pub fn run(&self, request: PutObjectOperationRequest) -> Result<PutObjectOperationOutcome> {
        let PutObjectOperationRequest {
            body,
            format,
            width,
            height,
            tags,
            extended,
            owner_ref,
            provenance,
        } = request;

        if body.is_empty() {
            return Err(VaultError::InvalidRequest("object body is empty".to_string()));
        }
        if width == 0 || height == 0 {
            return Err(VaultError::InvalidRequest(format!(
                "invalid dimensions {}x{}",
                width, height
            )));
        }
        // Checked before allocation so a bad source never burns a sequence.
        if let Some(provenance) = &provenance {
            provenance.transformation.validate()?;
            if self
                .metadata
                .get_object(provenance.source_object_id)?
                .is_none()
            {
                return Err(VaultError::SourceNotFound(provenance.source_object_id));
            }
        }
        tracing::debug!("put {} bytes ({}): {}", body.len(), format, WriteState::Received);

        let digest = compute_digest(&body);
        tracing::debug!("put {}: {}", digest.primary, WriteState::Hashed);

        if let DuplicateLookup::Found { object, matched_by } = self.duplicates.lookup(&digest)? {
            tracing::warn!(
                "rejected duplicate content {} (existing object id={}, matched by {:?})",
                digest.primary,
                object.id,
                matched_by
            );
            return Ok(PutObjectOperationOutcome::Duplicate(
                DuplicateContent::from_object(&object, matched_by),
            ));
        }
        tracing::debug!("put {}: {}", digest.primary, WriteState::Checked);

        let shard = resolve_shard(&digest.primary)?;
        tracing::debug!("put {}: {} into {}", digest.primary, WriteState::Sharded, shard);

        let sequence = self.allocator.allocate_next(&shard)?;
        tracing::debug!(
            "put {}: {} as {}",
            digest.primary,
            WriteState::Sequenced,
            sequence
        );

        let new_object = NewObject {
            primary_hash: digest.primary.clone(),
            secondary_hash: digest.secondary.clone(),
            shard: shard.clone(),
            sequence,
            format,
            width,
            height,
            byte_size: body.len() as u64,
            tags,
            owner_ref,
            created_at: Utc::now(),
        };
        let filename = new_object.filename();

        let path = match self.blob_store.put_blob(&shard, &filename, &body) {
            Ok(path) => path,
            Err(error) => {
                tracing::warn!(
                    "blob write failed for {}, sequence {} in shard {} is skipped: {}",
                    digest.primary,
                    sequence,
                    shard,
                    error
                );
                return Err(error);
            }
        };
        tracing::debug!("put {}: {} at {}", digest.primary, WriteState::Persisted, path.display());

        let object_id = match self
            .metadata
            .persist(&new_object, &extended, provenance.as_ref())
        {
            Ok(object_id) => object_id,
            Err(VaultError::Sqlite(source)) if is_unique_violation(&source) => {
                return self.resolve_lost_race(&shard, &filename, path, &digest.primary, source);
            }
            Err(VaultError::Sqlite(source)) => {
                tracing::warn!(
                    "metadata commit failed for {}, orphan file left at {}",
                    digest.primary,
                    path.display()
                );
                return Err(VaultError::MetadataCommit {
                    path,
                    primary_hash: digest.primary,
                    source,
                });
            }
            Err(error) => return Err(error),
        };
        tracing::debug!("put {}: {} as id {}", digest.primary, WriteState::Recorded, object_id);

        let sidecar = regenerate_sidecar(&self.metadata, &self.blob_store, object_id)?;
        tracing::debug!("put {}: {}", digest.primary, WriteState::SidecarWritten);

        tracing::info!(
            "stored object id={} path={}",
            object_id,
            sidecar.object.relative_path()
        );

        Ok(PutObjectOperationOutcome::Stored(PutObjectOperationResult {
            object: sidecar.object,
            path,
            sidecar_path: sidecar.path,
        }))
    }

    /// Another writer committed the same content between our duplicate check
    /// and our commit. Our file has no row, so it is removed.
    fn resolve_lost_race(
        &self,
        shard: &ShardKey,
        filename: &str,
        path: PathBuf,
        primary_hash: &str,
        source: rusqlite::Error,
    ) -> Result<PutObjectOperationOutcome> {
        let Some(winner) = self.metadata.get_object_by_primary_hash(primary_hash)? else {
            return Err(VaultError::MetadataCommit {
                path,
                primary_hash: primary_hash.to_string(),
                source,
            });
        };

        self.blob_store.remove_blob(shard, filename)?;
        tracing::warn!(
            "concurrent upload of {} lost to object id={}, removed {}",
            primary_hash,
            winner.id,
            path.display()
        );

        Ok(PutObjectOperationOutcome::Duplicate(
            DuplicateContent::from_object(&winner, HashKind::Primary),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AllocationConfig;
    use crate::storage::{CounterStore, MemoryCounterStore, Transformation, compute_primary_hash};
    use std::collections::HashMap;
    use std::fs;
    use std::time::Duration;

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        blob_store: Arc<BlobStore>,
        metadata: Arc<MetadataStore>,
        counters: Arc<MemoryCounterStore>,
        operation: PutObjectOperation,
    }

    fn fixture() -> Fixture {
        let temp_dir = tempfile::tempdir().unwrap();
        let blob_store = Arc::new(BlobStore::new(temp_dir.path().join("objects")).unwrap());
        let metadata = Arc::new(
            MetadataStore::new(temp_dir.path().join("meta.db"), Duration::from_secs(5)).unwrap(),
        );
        let counters = Arc::new(MemoryCounterStore::new());
        let allocator = SequenceAllocator::new(counters.clone(), AllocationConfig::default());
        let operation = PutObjectOperation::new(
            blob_store.clone(),
            metadata.clone(),
            Arc::new(DuplicateIndex::new(metadata.clone())),
            allocator,
        );
        Fixture {
            _temp_dir: temp_dir,
            blob_store,
            metadata,
            counters,
            operation,
        }
    }

    fn stored(outcome: PutObjectOperationOutcome) -> PutObjectOperationResult {
        match outcome {
            PutObjectOperationOutcome::Stored(result) => result,
            other => panic!("expected Stored, got {:?}", other),
        }
    }

    #[test]
    fn test_put_stores_bytes_row_and_sidecar() {
        let f = fixture();
        let body = Bytes::from_static(b"jpeg bytes");
        let request = PutObjectOperationRequest::new(body.clone(), ImageFormat::Jpeg, 800, 600)
            .with_tags("cat photo");

        let result = stored(f.operation.run(request).unwrap());
        let object = &result.object;

        assert_eq!(object.sequence, 1);
        assert_eq!(object.filename, "1.jpg");
        assert_eq!(object.byte_size, body.len() as u64);
        assert_eq!(fs::read(&result.path).unwrap(), body.to_vec());
        assert!(result.sidecar_path.ends_with("1.json"));
        assert_eq!(f.metadata.get_object(object.id).unwrap().as_ref(), Some(object));
    }

    #[test]
    fn test_put_rejects_bad_input_without_allocating() {
        let f = fixture();

        let empty = PutObjectOperationRequest::new(Bytes::new(), ImageFormat::Png, 1, 1);
        assert!(matches!(f.operation.run(empty), Err(VaultError::InvalidRequest(_))));

        let flat = PutObjectOperationRequest::new(Bytes::from_static(b"x"), ImageFormat::Png, 0, 1);
        assert!(matches!(f.operation.run(flat), Err(VaultError::InvalidRequest(_))));

        let orphan = PutObjectOperationRequest::new(Bytes::from_static(b"x"), ImageFormat::Png, 1, 1)
            .with_provenance(NewProvenance {
                source_object_id: 42,
                transformation: Transformation::crop(0, 0, 1, 1),
            });
        assert!(matches!(f.operation.run(orphan), Err(VaultError::SourceNotFound(42))));

        assert_eq!(f.metadata.count_objects().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_returns_existing_address() {
        let f = fixture();
        let request = PutObjectOperationRequest::new(
            Bytes::from_static(b"same"),
            ImageFormat::Gif,
            10,
            10,
        );

        let first = stored(f.operation.run(request.clone()).unwrap());
        match f.operation.run(request).unwrap() {
            PutObjectOperationOutcome::Duplicate(duplicate) => {
                assert_eq!(duplicate.existing_id, first.object.id);
                assert_eq!(duplicate.existing_path, first.object.relative_path());
                assert_eq!(duplicate.matched_by, HashKind::Primary);
            }
            other => panic!("expected Duplicate, got {:?}", other),
        }

        // The rejected write consumed no sequence.
        let shard = first.object.shard();
        assert_eq!(f.counters.next_sequence(&shard).unwrap(), Some(2));
    }

    #[test]
    fn test_failed_blob_write_skips_sequence() {
        let f = fixture();
        let body = Bytes::from_static(b"will collide with a planted file");
        let digest = compute_digest(&body);
        let shard = resolve_shard(&digest.primary).unwrap();

        // A stray file at sequence 1 makes the first write fail.
        fs::create_dir_all(f.blob_store.shard_dir(&shard)).unwrap();
        fs::write(f.blob_store.blob_path(&shard, "1.png"), b"stray").unwrap();

        let request = PutObjectOperationRequest::new(body, ImageFormat::Png, 4, 4);
        assert!(matches!(
            f.operation.run(request.clone()),
            Err(VaultError::BlobWrite { .. })
        ));
        assert_eq!(f.metadata.count_objects().unwrap(), 0);

        let result = stored(f.operation.run(request).unwrap());
        assert_eq!(result.object.sequence, 2);
        assert_eq!(result.object.filename, "2.png");
    }

    /// Two payloads whose primary hashes share a shard.
    fn same_shard_payloads() -> (Bytes, Bytes) {
        let mut seen: HashMap<String, Bytes> = HashMap::new();
        for i in 0u32.. {
            let payload = Bytes::from(format!("shard mate {}", i));
            let prefix = compute_primary_hash(&payload)[..4].to_string();
            if let Some(other) = seen.insert(prefix, payload.clone()) {
                return (other, payload);
            }
        }
        unreachable!()
    }

    #[test]
    fn test_sequence_conflict_surfaces_as_metadata_commit() {
        let f = fixture();
        let (a, b) = same_shard_payloads();
        stored(
            f.operation
                .run(PutObjectOperationRequest::new(a, ImageFormat::Png, 2, 2))
                .unwrap(),
        );

        // A second writer whose counter has fallen behind hands out 1 again.
        let stale_counters = Arc::new(MemoryCounterStore::new());
        let stale = PutObjectOperation::new(
            f.blob_store.clone(),
            f.metadata.clone(),
            Arc::new(DuplicateIndex::new(f.metadata.clone())),
            SequenceAllocator::new(stale_counters, AllocationConfig::default()),
        );
        let request = PutObjectOperationRequest::new(b.clone(), ImageFormat::Jpeg, 2, 2);
        let orphan = match stale.run(request.clone()) {
            Err(VaultError::MetadataCommit {
                path, primary_hash, ..
            }) => {
                assert_eq!(primary_hash, compute_primary_hash(&b));
                path
            }
            other => panic!("expected MetadataCommit, got {:?}", other),
        };

        // The uncommitted bytes stay behind for reconciliation.
        let shard = resolve_shard(&compute_primary_hash(&b)).unwrap();
        assert_eq!(orphan, f.blob_store.blob_path(&shard, "1.jpg"));
        assert!(orphan.exists());
        assert_eq!(f.metadata.count_objects().unwrap(), 1);

        let retried = stored(stale.run(request).unwrap());
        assert_eq!(retried.object.sequence, 2);
        assert_eq!(retried.object.filename, "2.jpg");
    }

    #[test]
    fn test_sidecar_failure_keeps_committed_row() {
        let f = fixture();
        let body = Bytes::from_static(b"sidecar target is blocked");
        let shard = resolve_shard(&compute_primary_hash(&body)).unwrap();

        // A directory where the sidecar should go makes the rename fail.
        let blocked = f.blob_store.sidecar_path(&shard, "1.png");
        fs::create_dir_all(&blocked).unwrap();

        let request = PutObjectOperationRequest::new(body, ImageFormat::Png, 4, 4);
        match f.operation.run(request) {
            Err(VaultError::SidecarWrite { object_id, path, .. }) => {
                assert_eq!(object_id, 1);
                assert_eq!(path, blocked);
            }
            other => panic!("expected SidecarWrite, got {:?}", other),
        }

        assert_eq!(f.metadata.count_objects().unwrap(), 1);
        assert!(f.blob_store.blob_path(&shard, "1.png").exists());
    }

    #[test]
    fn test_write_state_names() {
        assert_eq!(WriteState::SidecarWritten.to_string(), "sidecar_written");
        assert_eq!(WriteState::Received.to_string(), "received");
    }
}
