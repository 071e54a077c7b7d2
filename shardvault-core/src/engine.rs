use crate::config::VaultConfig;
use crate::error::{Result, VaultError};
use crate::model::StoredObject;
use crate::operations::{
    ObjectLookup, PutObjectOperation, PutObjectOperationOutcome, PutObjectOperationRequest,
    ReadObjectOperation, ReadObjectOperationOutcome, ReadObjectOperationRequest,
    ReconcileOperation, ReconcileOperationRequest, ReconcileOperationResult, UpdateTagsOperation,
    UpdateTagsOperationOutcome, UpdateTagsOperationRequest, UpdateTagsOperationResult,
};
use crate::storage::{
    BlobStore, CounterStore, DuplicateIndex, MetadataStore, ProvenanceRecord, ProvenanceTracker,
    SearchQuery, SequenceAllocator, SqliteCounterStore, Transformation, regenerate_sidecar,
    verify_primary_hash,
};
use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

/// Entry point for callers: wires the stores and operations from one config.
pub struct StorageEngine {
    config: VaultConfig,
    blob_store: Arc<BlobStore>,
    metadata: Arc<MetadataStore>,
    provenance: ProvenanceTracker,
    put_object: PutObjectOperation,
    read_object: ReadObjectOperation,
    update_tags: UpdateTagsOperation,
    reconcile: ReconcileOperation,
}

impl StorageEngine {
    /// Open (or create) a store with SQLite-backed shard counters.
    pub fn new(config: VaultConfig) -> Result<Self> {
        config.validate()?;
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let counters = Arc::new(SqliteCounterStore::new(db_path, config.busy_timeout())?);
        Self::with_counter_store(config, counters)
    }

    pub fn with_counter_store(config: VaultConfig, counters: Arc<dyn CounterStore>) -> Result<Self> {
        config.validate()?;
        let blob_store = Arc::new(BlobStore::new(config.base_path.clone())?);
        let db_path = config.db_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let metadata = Arc::new(MetadataStore::new(db_path, config.busy_timeout())?);

        let allocator = SequenceAllocator::new(counters, config.allocation.clone());
        let duplicates = Arc::new(DuplicateIndex::new(metadata.clone()));

        tracing::info!(
            "opened store at {} (index {})",
            config.base_path.display(),
            metadata.db_path().display()
        );

        Ok(Self {
            provenance: ProvenanceTracker::new(metadata.clone()),
            put_object: PutObjectOperation::new(
                blob_store.clone(),
                metadata.clone(),
                duplicates,
                allocator,
            ),
            read_object: ReadObjectOperation::new(blob_store.clone(), metadata.clone()),
            update_tags: UpdateTagsOperation::new(blob_store.clone(), metadata.clone()),
            reconcile: ReconcileOperation::new(blob_store.clone(), metadata.clone()),
            config,
            blob_store,
            metadata,
        })
    }

    pub fn config(&self) -> &VaultConfig {
        &self.config
    }

    pub fn put(&self, request: PutObjectOperationRequest) -> Result<PutObjectOperationOutcome> {
        self.put_object.run(request)
    }

    pub fn get_object(&self, id: i64) -> Result<Option<StoredObject>> {
        self.metadata.get_object(id)
    }

    pub fn get_object_by_hash(&self, primary_hash: &str) -> Result<Option<StoredObject>> {
        self.metadata
            .get_object_by_primary_hash(&primary_hash.to_ascii_lowercase())
    }

    pub fn read_object(
        &self,
        lookup: ObjectLookup,
        include_body: bool,
    ) -> Result<ReadObjectOperationOutcome> {
        self.read_object.run(ReadObjectOperationRequest {
            lookup,
            include_body,
        })
    }

    /// Absolute path of the object's bytes.
    pub fn object_path(&self, id: i64) -> Result<PathBuf> {
        let object = self
            .metadata
            .get_object(id)?
            .ok_or(VaultError::ObjectNotFound(id))?;
        Ok(self.blob_store.blob_path(&object.shard(), &object.filename))
    }

    pub fn update_tags(&self, id: i64, tags: impl Into<String>) -> Result<UpdateTagsOperationResult> {
        let outcome = self.update_tags.run(UpdateTagsOperationRequest {
            object_id: id,
            tags: tags.into(),
        })?;
        match outcome {
            UpdateTagsOperationOutcome::Updated(result) => Ok(result),
            UpdateTagsOperationOutcome::NotFound => Err(VaultError::ObjectNotFound(id)),
        }
    }

    pub fn regenerate_sidecar(&self, id: i64) -> Result<PathBuf> {
        Ok(regenerate_sidecar(&self.metadata, &self.blob_store, id)?.path)
    }

    /// Record provenance for an already stored object and refresh its sidecar.
    pub fn record_provenance(
        &self,
        derived_object_id: i64,
        source_object_id: i64,
        transformation: &Transformation,
    ) -> Result<ProvenanceRecord> {
        let record = self
            .provenance
            .record(derived_object_id, source_object_id, transformation)?;
        regenerate_sidecar(&self.metadata, &self.blob_store, derived_object_id)?;
        Ok(record)
    }

    pub fn source_of(&self, id: i64) -> Result<Option<ProvenanceRecord>> {
        self.provenance.source_of(id)
    }

    pub fn derived_from(&self, id: i64) -> Result<Vec<i64>> {
        self.provenance.derived_from(id)
    }

    pub fn lineage(&self, id: i64) -> Result<Vec<ProvenanceRecord>> {
        self.provenance.lineage(id)
    }

    pub fn extended_metadata(&self, id: i64) -> Result<BTreeMap<String, String>> {
        self.metadata.extended_metadata(id)
    }

    pub fn list_objects(&self, after_id: i64, limit: usize) -> Result<Vec<StoredObject>> {
        self.metadata.list_objects(after_id, limit)
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<StoredObject>> {
        self.metadata.search(query)
    }

    /// Re-hash the stored bytes and compare with the recorded primary hash.
    pub fn verify_object(&self, id: i64) -> Result<StoredObject> {
        let object = self
            .metadata
            .get_object(id)?
            .ok_or(VaultError::ObjectNotFound(id))?;
        let shard = object.shard();

        let body = match self.blob_store.get_blob(&shard, &object.filename) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(VaultError::BlobMissing {
                    object_id: id,
                    path: self.blob_store.blob_path(&shard, &object.filename),
                });
            }
            Err(e) => return Err(e.into()),
        };

        verify_primary_hash(&body, &object.primary_hash)?;
        Ok(object)
    }

    pub fn reconcile(&self, request: ReconcileOperationRequest) -> Result<ReconcileOperationResult> {
        self.reconcile.run(request)
    }
}
