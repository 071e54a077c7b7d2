use crate::error::Result;
use crate::model::StoredObject;
use crate::storage::digest::{ContentDigest, HashKind};
use crate::storage::metadata_store::MetadataStore;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateLookup {
    Found {
        object: StoredObject,
        matched_by: HashKind,
    },
    NotFound,
}

/// Answers "is this content already stored?" from the metadata index.
/// The primary hash is checked first; the secondary hash catches objects
/// whose primary hash was assigned under an older scheme.
pub struct DuplicateIndex {
    metadata: Arc<MetadataStore>,
}

impl DuplicateIndex {
    pub fn new(metadata: Arc<MetadataStore>) -> Self {
        Self { metadata }
    }

    pub fn lookup(&self, digest: &ContentDigest) -> Result<DuplicateLookup> {
        if let Some(object) = self.metadata.get_object_by_primary_hash(&digest.primary)? {
            return Ok(DuplicateLookup::Found {
                object,
                matched_by: HashKind::Primary,
            });
        }

        if let Some(object) = self
            .metadata
            .get_object_by_secondary_hash(&digest.secondary)?
        {
            return Ok(DuplicateLookup::Found {
                object,
                matched_by: HashKind::Secondary,
            });
        }

        Ok(DuplicateLookup::NotFound)
    }
}
