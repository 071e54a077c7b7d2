//! Human-readable sidecar documents.
//!
//! A sidecar is a cache of committed rows (object, extended metadata,
//! provenance). It is rebuilt from those rows on every change and never read
//! back as a source of truth.

use crate::error::{Result, VaultError};
use crate::model::{ImageFormat, StoredObject};
use crate::storage::blob_store::BlobStore;
use crate::storage::metadata_store::{MetadataStore, load_extended_metadata, query_object};
use crate::storage::provenance::{self, ProvenanceRecord, Transformation};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const SIDECAR_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarDocument {
    pub primary_hash: String,
    pub secondary_hash: String,
    pub tags: String,
    pub image: SidecarImage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_metadata: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SidecarSource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarImage {
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SidecarSource {
    pub primary_hash: Option<String>,
    /// Source object's filename within its shard.
    pub source_reference: Option<String>,
    #[serde(flatten)]
    pub transformation: Transformation,
}

pub fn build_sidecar(
    object: &StoredObject,
    extended: &BTreeMap<String, String>,
    provenance: Option<(&ProvenanceRecord, Option<&StoredObject>)>,
) -> SidecarDocument {
    let extended_metadata = if object.has_extended_metadata && !extended.is_empty() {
        Some(extended.clone())
    } else {
        None
    };

    let source = provenance.map(|(record, source)| SidecarSource {
        primary_hash: source.map(|s| s.primary_hash.clone()),
        source_reference: source.map(|s| s.filename.clone()),
        transformation: record.transformation.clone(),
    });

    SidecarDocument {
        primary_hash: object.primary_hash.clone(),
        secondary_hash: object.secondary_hash.clone(),
        tags: object.tags.clone(),
        image: SidecarImage {
            width: object.width,
            height: object.height,
            format: object.format,
        },
        extended_metadata,
        source,
    }
}

pub fn render_sidecar(document: &SidecarDocument) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(document)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Build the sidecar for `object_id` from one consistent read of its rows.
pub fn load_sidecar_document(
    metadata: &MetadataStore,
    object_id: i64,
) -> Result<(StoredObject, SidecarDocument)> {
    let mut conn = metadata.get_conn()?;
    let tx = conn.transaction()?;

    let object = query_object(&tx, "id = ?1", params![object_id])?
        .ok_or(VaultError::ObjectNotFound(object_id))?;
    let extended = load_extended_metadata(&tx, object_id)?;
    let record = provenance::load_record(&tx, object_id)?;
    let source = match &record {
        Some(record) => query_object(&tx, "id = ?1", params![record.source_object_id])?,
        None => None,
    };
    tx.commit()?;

    let document = build_sidecar(
        &object,
        &extended,
        record.as_ref().map(|r| (r, source.as_ref())),
    );
    Ok((object, document))
}

/// A sidecar that was just rewritten from committed rows.
#[derive(Debug, Clone)]
pub struct WrittenSidecar {
    pub object: StoredObject,
    pub path: PathBuf,
}

/// Rebuild the sidecar of `object_id` and replace the file next to its bytes.
///
/// Rebuilds of the same object are serialized, and each one reads the rows
/// only after taking the lock.
pub fn regenerate_sidecar(
    metadata: &MetadataStore,
    blob_store: &BlobStore,
    object_id: i64,
) -> Result<WrittenSidecar> {
    let _guard = blob_store.lock_sidecar(object_id)?;
    let (object, document) = load_sidecar_document(metadata, object_id)?;
    let bytes = render_sidecar(&document)?;
    let path = blob_store.sidecar_path(&object.shard(), &object.filename);

    blob_store
        .put_sidecar(&path, &bytes)
        .map_err(|source| VaultError::SidecarWrite {
            object_id,
            path: path.clone(),
            source,
        })?;

    tracing::debug!("wrote sidecar for object {} at {}", object_id, path.display());
    Ok(WrittenSidecar { object, path })
}
