use crate::error::{Result, VaultError};
use crate::model::StoredObject;
use crate::storage::{BlobStore, MetadataStore};
use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Clone)]
pub struct ReadObjectOperation {
    blob_store: Arc<BlobStore>,
    metadata: Arc<MetadataStore>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectLookup {
    Id(i64),
    PrimaryHash(String),
}

#[derive(Debug, Clone)]
pub struct ReadObjectOperationRequest {
    pub lookup: ObjectLookup,
    pub include_body: bool,
}

#[derive(Debug, Clone)]
pub struct ReadObjectOperationResult {
    pub object: StoredObject,
    pub path: PathBuf,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub enum ReadObjectOperationOutcome {
    Found(ReadObjectOperationResult),
    NotFound,
}

impl ReadObjectOperation {
    pub fn new(blob_store: Arc<BlobStore>, metadata: Arc<MetadataStore>) -> Self {
        Self {
            blob_store,
            metadata,
        }
    }

    pub fn run(&self, request: ReadObjectOperationRequest) -> Result<ReadObjectOperationOutcome> {
        let ReadObjectOperationRequest {
            lookup,
            include_body,
        } = request;

        let object = match &lookup {
            ObjectLookup::Id(id) => self.metadata.get_object(*id)?,
            ObjectLookup::PrimaryHash(hash) => {
                self.metadata.get_object_by_primary_hash(&hash.to_ascii_lowercase())?
            }
        };
        let Some(object) = object else {
            return Ok(ReadObjectOperationOutcome::NotFound);
        };

        let shard = object.shard();
        let path = self.blob_store.blob_path(&shard, &object.filename);

        if !include_body {
            return Ok(ReadObjectOperationOutcome::Found(ReadObjectOperationResult {
                object,
                path,
                body: None,
            }));
        }

        let body = match self.blob_store.get_blob(&shard, &object.filename) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!("object {} has a row but no bytes at {}", object.id, path.display());
                return Err(VaultError::BlobMissing {
                    object_id: object.id,
                    path,
                });
            }
            Err(e) => return Err(e.into()),
        };

        Ok(ReadObjectOperationOutcome::Found(ReadObjectOperationResult {
            object,
            path,
            body: Some(body),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageFormat, NewObject};
    use crate::storage::{compute_digest, resolve_shard};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn setup() -> (tempfile::TempDir, ReadObjectOperation, Arc<BlobStore>, StoredObject) {
        let temp_dir = tempfile::tempdir().unwrap();
        let blob_store = Arc::new(BlobStore::new(temp_dir.path().to_path_buf()).unwrap());
        let metadata = Arc::new(
            MetadataStore::new(temp_dir.path().join("meta.db"), Duration::from_secs(5)).unwrap(),
        );

        let body = Bytes::from_static(b"png pixels");
        let digest = compute_digest(&body);
        let new_object = NewObject {
            primary_hash: digest.primary.clone(),
            secondary_hash: digest.secondary,
            shard: resolve_shard(&digest.primary).unwrap(),
            sequence: 1,
            format: ImageFormat::Png,
            width: 2,
            height: 2,
            byte_size: body.len() as u64,
            tags: "tiny".to_string(),
            owner_ref: None,
            created_at: Utc::now(),
        };
        blob_store
            .put_blob(&new_object.shard, &new_object.filename(), &body)
            .unwrap();
        let id = metadata.persist(&new_object, &BTreeMap::new(), None).unwrap();
        let object = metadata.get_object(id).unwrap().unwrap();

        let operation = ReadObjectOperation::new(blob_store.clone(), metadata);
        (temp_dir, operation, blob_store, object)
    }

    #[test]
    fn test_read_by_id_and_hash() {
        let (_dir, operation, _blobs, object) = setup();

        for lookup in [
            ObjectLookup::Id(object.id),
            ObjectLookup::PrimaryHash(object.primary_hash.to_ascii_uppercase()),
        ] {
            let outcome = operation
                .run(ReadObjectOperationRequest {
                    lookup,
                    include_body: true,
                })
                .unwrap();
            let ReadObjectOperationOutcome::Found(result) = outcome else {
                panic!("expected Found");
            };
            assert_eq!(result.object, object);
            assert_eq!(result.body, Some(Bytes::from_static(b"png pixels")));
        }
    }

    #[test]
    fn test_read_without_body_skips_file() {
        let (_dir, operation, blobs, object) = setup();
        blobs.remove_blob(&object.shard(), &object.filename).unwrap();

        let outcome = operation
            .run(ReadObjectOperationRequest {
                lookup: ObjectLookup::Id(object.id),
                include_body: false,
            })
            .unwrap();
        let ReadObjectOperationOutcome::Found(result) = outcome else {
            panic!("expected Found");
        };
        assert!(result.body.is_none());
        assert!(result.path.ends_with(object.relative_path()));
    }

    #[test]
    fn test_read_missing_bytes() {
        let (_dir, operation, blobs, object) = setup();
        blobs.remove_blob(&object.shard(), &object.filename).unwrap();

        let err = operation
            .run(ReadObjectOperationRequest {
                lookup: ObjectLookup::Id(object.id),
                include_body: true,
            })
            .unwrap_err();
        assert!(matches!(err, VaultError::BlobMissing { object_id, .. } if object_id == object.id));
    }

    #[test]
    fn test_read_not_found() {
        let (_dir, operation, _blobs, _object) = setup();
        let outcome = operation
            .run(ReadObjectOperationRequest {
                lookup: ObjectLookup::PrimaryHash("0000000000000000".to_string()),
                include_body: true,
            })
            .unwrap();
        assert!(matches!(outcome, ReadObjectOperationOutcome::NotFound));
    }
}
