//! Edited-from relationships between stored objects.
//!
//! Each derived object has at most one provenance row naming its source and
//! the edits applied. Sources may themselves be derived, so the rows form a
//! DAG rooted at original uploads.

use crate::error::{Result, VaultError};
use crate::storage::metadata_store::{MetadataStore, query_object};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Edits applied to a source to produce a derived object.
///
/// Field order is the serialization order, so the JSON form is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transformation {
    /// `[left, top, right, bottom]` in source pixels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crop: Option<[u32; 4]>,
    /// Cumulative brightness multiplier, 1.0 = unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<f64>,
    /// Cumulative contrast multiplier, 1.0 = unchanged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contrast: Option<f64>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub background_removed: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

impl Transformation {
    pub fn crop(left: u32, top: u32, right: u32, bottom: u32) -> Self {
        Self {
            crop: Some([left, top, right, bottom]),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.crop.is_none()
            && self.brightness.is_none()
            && self.contrast.is_none()
            && !self.background_removed
            && self.extra.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if let Some([left, top, right, bottom]) = self.crop {
            if right <= left || bottom <= top {
                return Err(VaultError::InvalidRequest(format!(
                    "invalid crop rectangle [{}, {}, {}, {}]",
                    left, top, right, bottom
                )));
            }
        }
        for (name, value) in [("brightness", self.brightness), ("contrast", self.contrast)] {
            if let Some(value) = value {
                if !value.is_finite() || value <= 0.0 {
                    return Err(VaultError::InvalidRequest(format!(
                        "{} multiplier must be positive, got {}",
                        name, value
                    )));
                }
            }
        }
        Ok(())
    }

    /// Apply `next` on top of `self`: multipliers multiply, a later crop is
    /// relative to the earlier one, flags stick.
    ///
    /// Fails with `InvalidRequest` when the composed crop leaves the `u32` range.
    pub fn then(&self, next: &Transformation) -> Result<Transformation> {
        let crop = match (self.crop, next.crop) {
            (Some([l, t, _, _]), Some([nl, nt, nr, nb])) => {
                let shifted = [
                    l.checked_add(nl),
                    t.checked_add(nt),
                    l.checked_add(nr),
                    t.checked_add(nb),
                ];
                let [Some(left), Some(top), Some(right), Some(bottom)] = shifted else {
                    return Err(VaultError::InvalidRequest(format!(
                        "composed crop overflows: [{}, {}] offset by [{}, {}, {}, {}]",
                        l, t, nl, nt, nr, nb
                    )));
                };
                Some([left, top, right, bottom])
            }
            (first, second) => second.or(first),
        };

        let multiply = |a: Option<f64>, b: Option<f64>| match (a, b) {
            (Some(a), Some(b)) => Some(round3(a * b)),
            (a, b) => b.or(a).map(round3),
        };

        let mut extra = self.extra.clone();
        extra.extend(next.extra.clone());

        Ok(Transformation {
            crop,
            brightness: multiply(self.brightness, next.brightness),
            contrast: multiply(self.contrast, next.contrast),
            background_removed: self.background_removed || next.background_removed,
            extra,
        })
    }
}

/// Provenance supplied with a new write.
#[derive(Debug, Clone)]
pub struct NewProvenance {
    pub source_object_id: i64,
    pub transformation: Transformation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub derived_object_id: i64,
    pub source_object_id: i64,
    pub transformation: Transformation,
}

pub(crate) fn insert_record(
    conn: &Connection,
    derived_object_id: i64,
    source_object_id: i64,
    transformation: &Transformation,
) -> Result<()> {
    let transformation_json = serde_json::to_string(transformation)?;
    conn.execute(
        "INSERT INTO provenance (object_id, source_object_id, transformation_json)
         VALUES (?1, ?2, ?3)",
        params![derived_object_id, source_object_id, transformation_json],
    )?;
    Ok(())
}

pub(crate) fn load_record(conn: &Connection, derived_object_id: i64) -> Result<Option<ProvenanceRecord>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT source_object_id, transformation_json FROM provenance WHERE object_id = ?1",
            [derived_object_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    match row {
        Some((source_object_id, transformation_json)) => Ok(Some(ProvenanceRecord {
            derived_object_id,
            source_object_id,
            transformation: serde_json::from_str(&transformation_json)?,
        })),
        None => Ok(None),
    }
}

fn object_exists(conn: &Connection, id: i64) -> Result<bool> {
    Ok(query_object(conn, "id = ?1", params![id])?.is_some())
}

pub struct ProvenanceTracker {
    metadata: Arc<MetadataStore>,
}

impl ProvenanceTracker {
    pub fn new(metadata: Arc<MetadataStore>) -> Self {
        Self { metadata }
    }

    /// Record that `derived_object_id` was produced from `source_object_id`.
    pub fn record(
        &self,
        derived_object_id: i64,
        source_object_id: i64,
        transformation: &Transformation,
    ) -> Result<ProvenanceRecord> {
        transformation.validate()?;
        if derived_object_id == source_object_id {
            return Err(VaultError::InvalidRequest(format!(
                "object {} cannot be derived from itself",
                derived_object_id
            )));
        }

        let mut conn = self.metadata.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if !object_exists(&tx, derived_object_id)? {
            return Err(VaultError::ObjectNotFound(derived_object_id));
        }
        if !object_exists(&tx, source_object_id)? {
            return Err(VaultError::SourceNotFound(source_object_id));
        }
        if load_record(&tx, derived_object_id)?.is_some() {
            return Err(VaultError::InvalidRequest(format!(
                "object {} already has a provenance record",
                derived_object_id
            )));
        }
        if ancestors(&tx, source_object_id)?.contains(&derived_object_id) {
            return Err(VaultError::InvalidRequest(format!(
                "object {} is an ancestor of {}",
                derived_object_id, source_object_id
            )));
        }

        insert_record(&tx, derived_object_id, source_object_id, transformation)?;
        tx.commit()?;

        tracing::info!(
            "recorded provenance derived={} source={}",
            derived_object_id,
            source_object_id
        );

        Ok(ProvenanceRecord {
            derived_object_id,
            source_object_id,
            transformation: transformation.clone(),
        })
    }

    pub fn source_of(&self, object_id: i64) -> Result<Option<ProvenanceRecord>> {
        let conn = self.metadata.get_conn()?;
        load_record(&conn, object_id)
    }

    /// Objects recorded as derived directly from `object_id`.
    pub fn derived_from(&self, object_id: i64) -> Result<Vec<i64>> {
        let conn = self.metadata.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT object_id FROM provenance WHERE source_object_id = ?1 ORDER BY object_id",
        )?;
        let rows = stmt.query_map([object_id], |row| row.get(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Ancestors of `object_id`, nearest first.
    pub fn lineage(&self, object_id: i64) -> Result<Vec<ProvenanceRecord>> {
        let conn = self.metadata.get_conn()?;
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut current = object_id;

        while let Some(record) = load_record(&conn, current)? {
            if !seen.insert(record.source_object_id) {
                return Err(VaultError::Internal(format!(
                    "provenance cycle through object {}",
                    record.source_object_id
                )));
            }
            current = record.source_object_id;
            chain.push(record);
        }
        Ok(chain)
    }
}

fn ancestors(conn: &Connection, object_id: i64) -> Result<HashSet<i64>> {
    let mut found = HashSet::new();
    let mut current = object_id;
    while let Some(record) = load_record(conn, current)? {
        if !found.insert(record.source_object_id) {
            break;
        }
        current = record.source_object_id;
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ImageFormat, NewObject};
    use crate::storage::shard::ShardKey;
    use chrono::Utc;
    use std::time::Duration;

    fn seeded_store(dir: &tempfile::TempDir, count: u64) -> Arc<MetadataStore> {
        let store =
            Arc::new(MetadataStore::new(dir.path().join("meta.db"), Duration::from_secs(5)).unwrap());
        for i in 1..=count {
            let object = NewObject {
                primary_hash: format!("ab{:014x}", i),
                secondary_hash: format!("{:040x}", i),
                shard: ShardKey::new("ab", "00"),
                sequence: i,
                format: ImageFormat::Png,
                width: 10,
                height: 10,
                byte_size: 100,
                tags: String::new(),
                owner_ref: None,
                created_at: Utc::now(),
            };
            store.persist(&object, &BTreeMap::new(), None).unwrap();
        }
        store
    }

    #[test]
    fn test_transformation_json_is_compact_and_ordered() {
        let mut t = Transformation::crop(0, 0, 400, 300);
        t.brightness = Some(1.25);
        t.background_removed = true;
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(
            json,
            r#"{"crop":[0,0,400,300],"brightness":1.25,"background_removed":true}"#
        );

        let restored: Transformation = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, t);
    }

    #[test]
    fn test_unknown_fields_are_kept() {
        let t: Transformation = serde_json::from_str(r#"{"rotate":90,"crop":[1,2,3,4]}"#).unwrap();
        assert_eq!(t.crop, Some([1, 2, 3, 4]));
        assert_eq!(t.extra.get("rotate"), Some(&serde_json::json!(90)));
    }

    #[test]
    fn test_validate() {
        Transformation::crop(0, 0, 400, 300).validate().unwrap();
        assert!(Transformation::crop(10, 0, 10, 300).validate().is_err());
        let dark = Transformation {
            brightness: Some(0.0),
            ..Transformation::default()
        };
        assert!(dark.validate().is_err());
    }

    #[test]
    fn test_then_composes_edits() {
        let first = Transformation {
            crop: Some([100, 50, 500, 450]),
            brightness: Some(1.2),
            ..Transformation::default()
        };
        let second = Transformation {
            crop: Some([10, 10, 110, 60]),
            brightness: Some(1.1),
            contrast: Some(0.9),
            background_removed: true,
            ..Transformation::default()
        };

        let combined = first.then(&second).unwrap();
        assert_eq!(combined.crop, Some([110, 60, 210, 110]));
        assert_eq!(combined.brightness, Some(1.32));
        assert_eq!(combined.contrast, Some(0.9));
        assert!(combined.background_removed);
    }

    #[test]
    fn test_then_rejects_crop_overflow() {
        let first = Transformation::crop(u32::MAX - 10, 0, u32::MAX, 100);
        let second = Transformation::crop(5, 0, 20, 50);

        assert!(matches!(
            first.then(&second),
            Err(VaultError::InvalidRequest(_))
        ));
        assert_eq!(
            first.then(&Transformation::crop(5, 0, 10, 50)).unwrap().crop,
            Some([u32::MAX - 5, 0, u32::MAX, 50])
        );
    }

    #[test]
    fn test_record_and_query() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tracker = ProvenanceTracker::new(seeded_store(&temp_dir, 3));

        tracker.record(2, 1, &Transformation::crop(0, 0, 5, 5)).unwrap();
        tracker.record(3, 2, &Transformation::default()).unwrap();

        let record = tracker.source_of(2).unwrap().unwrap();
        assert_eq!(record.source_object_id, 1);
        assert_eq!(record.transformation.crop, Some([0, 0, 5, 5]));
        assert!(tracker.source_of(1).unwrap().is_none());

        assert_eq!(tracker.derived_from(1).unwrap(), vec![2]);
        let lineage: Vec<i64> = tracker
            .lineage(3)
            .unwrap()
            .iter()
            .map(|r| r.source_object_id)
            .collect();
        assert_eq!(lineage, vec![2, 1]);
    }

    #[test]
    fn test_record_rejects_bad_links() {
        let temp_dir = tempfile::tempdir().unwrap();
        let tracker = ProvenanceTracker::new(seeded_store(&temp_dir, 2));
        let none = Transformation::default();

        assert!(matches!(
            tracker.record(1, 1, &none),
            Err(VaultError::InvalidRequest(_))
        ));
        assert!(matches!(
            tracker.record(1, 9, &none),
            Err(VaultError::SourceNotFound(9))
        ));
        assert!(matches!(
            tracker.record(9, 1, &none),
            Err(VaultError::ObjectNotFound(9))
        ));

        tracker.record(2, 1, &none).unwrap();
        // Second record for the same derived object.
        assert!(matches!(
            tracker.record(2, 1, &none),
            Err(VaultError::InvalidRequest(_))
        ));
        // Would close a cycle 1 -> 2 -> 1.
        assert!(matches!(
            tracker.record(1, 2, &none),
            Err(VaultError::InvalidRequest(_))
        ));
    }
}
