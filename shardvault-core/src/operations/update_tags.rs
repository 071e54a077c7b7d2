use crate::error::Result;
use crate::model::StoredObject;
use crate::storage::{BlobStore, MetadataStore, regenerate_sidecar};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct UpdateTagsOperation {
    blob_store: Arc<BlobStore>,
    metadata: Arc<MetadataStore>,
}

#[derive(Debug, Clone)]
pub struct UpdateTagsOperationRequest {
    pub object_id: i64,
    pub tags: String,
}

#[derive(Debug, Clone)]
pub struct UpdateTagsOperationResult {
    pub object: StoredObject,
    pub sidecar_path: PathBuf,
}

#[derive(Debug, Clone)]
pub enum UpdateTagsOperationOutcome {
    Updated(UpdateTagsOperationResult),
    NotFound,
}

impl UpdateTagsOperation {
    pub fn new(blob_store: Arc<BlobStore>, metadata: Arc<MetadataStore>) -> Self {
        Self {
            blob_store,
            metadata,
        }
    }

    pub fn run(&self, request: UpdateTagsOperationRequest) -> Result<UpdateTagsOperationOutcome> {
        let UpdateTagsOperationRequest { object_id, tags } = request;

        if !self.metadata.update_tags(object_id, &tags)? {
            return Ok(UpdateTagsOperationOutcome::NotFound);
        }

        let sidecar = regenerate_sidecar(&self.metadata, &self.blob_store, object_id)?;
        tracing::info!("updated tags for object id={} tags={:?}", object_id, tags);

        Ok(UpdateTagsOperationOutcome::Updated(UpdateTagsOperationResult {
            object: sidecar.object,
            sidecar_path: sidecar.path,
        }))
    }
}
