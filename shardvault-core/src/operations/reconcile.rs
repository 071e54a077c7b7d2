use crate::error::Result;
use crate::storage::{
    BlobStore, MetadataStore, load_sidecar_document, regenerate_sidecar, render_sidecar,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::sync::Arc;

const PAGE_SIZE: usize = 256;

/// Compares the shard tree with the `objects` table.
///
/// Reports bytes without rows and rows without bytes, and checks every
/// sidecar against a fresh rendering of its rows. Blob files whose length
/// differs from the recorded `byte_size` are reported as size mismatches.
/// Nothing is ever deleted; only sidecars are rewritten, and only when asked.
///
/// The file scan happens before the rows are paged, so writes in flight
/// during the sweep can show up either way: as orphan files when the blob
/// landed before its row committed, or as orphan rows when the row
/// committed after the scan.
#[derive(Clone)]
pub struct ReconcileOperation {
    blob_store: Arc<BlobStore>,
    metadata: Arc<MetadataStore>,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOperationRequest {
    pub repair_sidecars: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOperationResult {
    pub objects_checked: u64,
    /// Relative paths of files with no committed row.
    pub orphan_files: Vec<String>,
    /// Ids of rows whose bytes are missing.
    pub orphan_rows: Vec<i64>,
    /// Ids of rows whose blob length differs from `byte_size`.
    pub size_mismatches: Vec<i64>,
    pub missing_sidecars: Vec<i64>,
    pub stale_sidecars: Vec<i64>,
    pub repaired_sidecars: Vec<i64>,
}

impl ReconcileOperationResult {
    pub fn is_clean(&self) -> bool {
        self.orphan_files.is_empty()
            && self.orphan_rows.is_empty()
            && self.size_mismatches.is_empty()
            && self.missing_sidecars.is_empty()
            && self.stale_sidecars.is_empty()
    }
}

impl ReconcileOperation {
    pub fn new(blob_store: Arc<BlobStore>, metadata: Arc<MetadataStore>) -> Self {
        Self {
            blob_store,
            metadata,
        }
    }

    pub fn run(&self, request: ReconcileOperationRequest) -> Result<ReconcileOperationResult> {
        let ReconcileOperationRequest { repair_sidecars } = request;

        let files = self.blob_store.scan()?;
        let on_disk: BTreeMap<String, u64> =
            files.iter().map(|f| (f.relative_path(), f.len)).collect();
        let mut claimed = BTreeSet::new();
        let mut result = ReconcileOperationResult::default();

        let mut after_id = 0;
        loop {
            let page = self.metadata.list_objects(after_id, PAGE_SIZE)?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;

            for object in page {
                result.objects_checked += 1;
                let shard = object.shard();

                let blob_relative = object.relative_path();
                match on_disk.get(&blob_relative) {
                    None => {
                        tracing::warn!(
                            "orphan row: object {} has no bytes at {}",
                            object.id,
                            blob_relative
                        );
                        result.orphan_rows.push(object.id);
                    }
                    Some(&len) if len != object.byte_size => {
                        tracing::warn!(
                            "size mismatch: object {} records {} bytes, {} holds {}",
                            object.id,
                            object.byte_size,
                            blob_relative,
                            len
                        );
                        result.size_mismatches.push(object.id);
                    }
                    Some(_) => {}
                }
                claimed.insert(blob_relative);

                let sidecar_path = self.blob_store.sidecar_path(&shard, &object.filename);
                if let Some(name) = sidecar_path.file_name().and_then(|n| n.to_str()) {
                    claimed.insert(format!("{}/{}", shard, name));
                }

                let (_, document) = load_sidecar_document(&self.metadata, object.id)?;
                let expected = render_sidecar(&document)?;
                let needs_repair = match fs::read(&sidecar_path) {
                    Ok(actual) if actual == expected => false,
                    Ok(_) => {
                        tracing::warn!("stale sidecar for object {}", object.id);
                        result.stale_sidecars.push(object.id);
                        true
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        tracing::warn!("missing sidecar for object {}", object.id);
                        result.missing_sidecars.push(object.id);
                        true
                    }
                    Err(e) => return Err(e.into()),
                };

                if needs_repair && repair_sidecars {
                    regenerate_sidecar(&self.metadata, &self.blob_store, object.id)?;
                    result.repaired_sidecars.push(object.id);
                }
            }
        }

        for file in &files {
            let relative = file.relative_path();
            if !claimed.contains(&relative) {
                tracing::warn!("orphan file: {} has no committed row", relative);
                result.orphan_files.push(relative);
            }
        }

        tracing::info!(
            "reconciled {} objects: {} orphan files, {} orphan rows, {} size mismatches, {} missing and {} stale sidecars, {} repaired",
            result.objects_checked,
            result.orphan_files.len(),
            result.orphan_rows.len(),
            result.size_mismatches.len(),
            result.missing_sidecars.len(),
            result.stale_sidecars.len(),
            result.repaired_sidecars.len()
        );
        Ok(result)
    }
}
