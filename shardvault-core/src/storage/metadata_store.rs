use crate::error::Result;
use crate::model::{ImageFormat, NewObject, StoredObject};
use crate::storage::provenance::{self, NewProvenance};
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_SEARCH_LIMIT: usize = 100;

const OBJECT_COLUMNS: &str = "id, primary_hash, secondary_hash, shard1, shard2, sequence, filename,
    format, width, height, byte_size, tags, has_extended_metadata, created_at, owner_ref";

/// Open a connection with the store's pragmas applied.
pub(crate) fn open_connection(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    conn.pragma_update(None, "foreign_keys", true)?;
    Ok(conn)
}

/// SQLITE_BUSY / SQLITE_LOCKED: another writer holds the lock.
pub(crate) fn is_contention(error: &rusqlite::Error) -> bool {
    matches!(
        error.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

/// UNIQUE constraint failures only; foreign key failures are not included.
pub(crate) fn is_unique_violation(error: &rusqlite::Error) -> bool {
    match error {
        rusqlite::Error::SqliteFailure(inner, _) => {
            inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        }
        _ => false,
    }
}

/// Filter for `MetadataStore::search`.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Whitespace-separated terms; every term must occur in `tags`.
    pub terms: String,
    pub format: Option<ImageFormat>,
    pub limit: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            terms: String::new(),
            format: None,
            limit: DEFAULT_SEARCH_LIMIT,
        }
    }
}

/// Relational index: objects, extended metadata and provenance.
pub struct MetadataStore {
    db_path: PathBuf,
    busy_timeout: Duration,
}

impl MetadataStore {
    pub fn new(db_path: PathBuf, busy_timeout: Duration) -> Result<Self> {
        let store = Self {
            db_path,
            busy_timeout,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub(crate) fn get_conn(&self) -> Result<Connection> {
        Ok(open_connection(&self.db_path, self.busy_timeout)?)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS objects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                primary_hash TEXT NOT NULL UNIQUE,
                secondary_hash TEXT NOT NULL,
                shard1 TEXT NOT NULL,
                shard2 TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                filename TEXT NOT NULL,
                format TEXT NOT NULL,
                width INTEGER NOT NULL,
                height INTEGER NOT NULL,
                byte_size INTEGER NOT NULL,
                tags TEXT NOT NULL DEFAULT '',
                has_extended_metadata INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                owner_ref INTEGER,
                UNIQUE (shard1, shard2, sequence)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_objects_secondary_hash ON objects(secondary_hash)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS extended_metadata (
                object_id INTEGER NOT NULL,
                tag_name TEXT NOT NULL,
                tag_value TEXT NOT NULL,
                FOREIGN KEY (object_id) REFERENCES objects(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_extended_metadata_object
             ON extended_metadata(object_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS provenance (
                object_id INTEGER NOT NULL UNIQUE,
                source_object_id INTEGER NOT NULL,
                transformation_json TEXT NOT NULL,
                FOREIGN KEY (object_id) REFERENCES objects(id),
                FOREIGN KEY (source_object_id) REFERENCES objects(id)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_provenance_source ON provenance(source_object_id)",
            [],
        )?;

        Ok(())
    }

    /// Commit an object row, its extended metadata and optional provenance in
    /// one transaction. Returns the new object id.
    pub fn persist(
        &self,
        object: &NewObject,
        extended: &BTreeMap<String, String>,
        provenance: Option<&NewProvenance>,
    ) -> Result<i64> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "INSERT INTO objects (
                primary_hash, secondary_hash, shard1, shard2, sequence, filename,
                format, width, height, byte_size, tags, has_extended_metadata,
                created_at, owner_ref
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                object.primary_hash,
                object.secondary_hash,
                object.shard.shard1,
                object.shard.shard2,
                object.sequence as i64,
                object.filename(),
                object.format.as_str(),
                object.width,
                object.height,
                object.byte_size as i64,
                object.tags,
                !extended.is_empty(),
                object.created_at.to_rfc3339(),
                object.owner_ref,
            ],
        )?;
        let object_id = tx.last_insert_rowid();

        for (tag_name, tag_value) in extended {
            tx.execute(
                "INSERT INTO extended_metadata (object_id, tag_name, tag_value)
                 VALUES (?1, ?2, ?3)",
                params![object_id, tag_name, tag_value],
            )?;
        }

        if let Some(provenance) = provenance {
            provenance::insert_record(
                &tx,
                object_id,
                provenance.source_object_id,
                &provenance.transformation,
            )?;
        }

        tx.commit()?;
        Ok(object_id)
    }

    pub fn get_object(&self, id: i64) -> Result<Option<StoredObject>> {
        let conn = self.get_conn()?;
        Ok(query_object(&conn, "id = ?1", params![id])?)
    }

    pub fn get_object_by_primary_hash(&self, primary_hash: &str) -> Result<Option<StoredObject>> {
        let conn = self.get_conn()?;
        Ok(query_object(&conn, "primary_hash = ?1", params![primary_hash])?)
    }

    /// Oldest object carrying this secondary hash.
    pub fn get_object_by_secondary_hash(
        &self,
        secondary_hash: &str,
    ) -> Result<Option<StoredObject>> {
        let conn = self.get_conn()?;
        Ok(query_object(
            &conn,
            "secondary_hash = ?1 ORDER BY id LIMIT 1",
            params![secondary_hash],
        )?)
    }

    /// Replace the tag string. Returns `false` if the object does not exist.
    pub fn update_tags(&self, id: i64, tags: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE objects SET tags = ?1 WHERE id = ?2",
            params![tags, id],
        )?;
        Ok(affected > 0)
    }

    pub fn extended_metadata(&self, id: i64) -> Result<BTreeMap<String, String>> {
        let conn = self.get_conn()?;
        Ok(load_extended_metadata(&conn, id)?)
    }

    /// Objects with `id > after_id`, in id order.
    pub fn list_objects(&self, after_id: i64, limit: usize) -> Result<Vec<StoredObject>> {
        let conn = self.get_conn()?;
        let sql = format!(
            "SELECT {} FROM objects WHERE id > ?1 ORDER BY id LIMIT ?2",
            OBJECT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![after_id, limit as i64], row_to_object)?;

        let mut objects = Vec::new();
        for row in rows {
            objects.push(row?);
        }
        Ok(objects)
    }

    pub fn search(&self, query: &SearchQuery) -> Result<Vec<StoredObject>> {
        let mut conditions = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        for term in query.terms.split_whitespace() {
            values.push(Value::Text(format!("%{}%", escape_like(term))));
            conditions.push(format!("tags LIKE ?{} ESCAPE '\\'", values.len()));
        }

        if let Some(format) = query.format {
            values.push(Value::Text(format.as_str().to_string()));
            conditions.push(format!("format = ?{}", values.len()));
        }

        let where_clause = if conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            conditions.join(" AND ")
        };

        values.push(Value::Integer(query.limit as i64));
        let sql = format!(
            "SELECT {} FROM objects WHERE {} ORDER BY id DESC LIMIT ?{}",
            OBJECT_COLUMNS,
            where_clause,
            values.len()
        );

        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), row_to_object)?;

        let mut objects = Vec::new();
        for row in rows {
            objects.push(row?);
        }
        Ok(objects)
    }

    pub fn count_objects(&self) -> Result<u64> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM objects", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

pub(crate) fn query_object(
    conn: &Connection,
    predicate: &str,
    params: impl rusqlite::Params,
) -> rusqlite::Result<Option<StoredObject>> {
    let sql = format!("SELECT {} FROM objects WHERE {}", OBJECT_COLUMNS, predicate);
    conn.query_row(&sql, params, row_to_object).optional()
}

pub(crate) fn load_extended_metadata(
    conn: &Connection,
    id: i64,
) -> rusqlite::Result<BTreeMap<String, String>> {
    let mut stmt = conn.prepare(
        "SELECT tag_name, tag_value FROM extended_metadata WHERE object_id = ?1",
    )?;
    let rows = stmt.query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?;

    let mut tags = BTreeMap::new();
    for row in rows {
        let (name, value): (String, String) = row?;
        tags.insert(name, value);
    }
    Ok(tags)
}

fn row_to_object(row: &Row<'_>) -> rusqlite::Result<StoredObject> {
    let format: String = row.get(7)?;
    let format = format
        .parse::<ImageFormat>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(e)))?;

    let created_at: String = row.get(13)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(13, Type::Text, Box::new(e)))?
        .with_timezone(&Utc);

    let sequence: i64 = row.get(5)?;
    let byte_size: i64 = row.get(10)?;

    Ok(StoredObject {
        id: row.get(0)?,
        primary_hash: row.get(1)?,
        secondary_hash: row.get(2)?,
        shard1: row.get(3)?,
        shard2: row.get(4)?,
        sequence: sequence as u64,
        filename: row.get(6)?,
        format,
        width: row.get(8)?,
        height: row.get(9)?,
        byte_size: byte_size as u64,
        tags: row.get(11)?,
        has_extended_metadata: row.get(12)?,
        created_at,
        owner_ref: row.get(14)?,
    })
}

fn escape_like(term: &str) -> String {
    let mut escaped = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
