//! SQLite-backed document store
//!
//! Each document is a JSON body keyed by `(collection, id)` with a version
//! counter. All mutations go through [`Store::commit`], which applies a
//! [`WriteBatch`] inside one SQLite transaction: either every write lands or
//! none does.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::batch::{Write, WriteBatch};
use crate::document::{DocRef, Document, Fields, add_number, get_path, set_path, validate_path};
use crate::error::{Result, StoreError};
use crate::now_ms;
use crate::query::Query;

/// Database file name inside the store directory
pub const DB_FILE: &str = "entities.db";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS documents (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    version INTEGER NOT NULL,
    body TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(collection);
"#;

/// Synchronous document store. Not `Sync`; wrap it in an actor for shared async access.
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a store in `dir`
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        debug!(dir = %dir.display(), "open: called");
        std::fs::create_dir_all(dir)?;
        let conn = Connection::open(dir.join(DB_FILE))?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        info!(dir = %dir.display(), "Opened entity store");
        Self::init(conn)
    }

    /// Open a throwaway store that lives only as long as this value
    pub fn open_in_memory() -> Result<Self> {
        debug!("open_in_memory: called");
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn get(&self, reference: &DocRef) -> Result<Option<Document>> {
        debug!(%reference, "get: called");
        read_doc(&self.conn, reference)
    }

    /// Run a query over one collection
    pub fn query(&self, query: &Query) -> Result<Vec<Document>> {
        debug!(collection = %query.collection, filters = query.filters.len(), "query: called");
        query.validate()?;
        let docs = load_collection(&self.conn, &query.collection)?;
        Ok(query.apply(docs))
    }

    /// Collection names with their document counts
    pub fn collections(&self) -> Result<Vec<(String, usize)>> {
        debug!("collections: called");
        let mut stmt = self
            .conn
            .prepare("SELECT collection, COUNT(*) FROM documents GROUP BY collection ORDER BY collection")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut out = Vec::new();
        for row in rows {
            let (name, count) = row?;
            out.push((name, count as usize));
        }
        Ok(out)
    }

    pub fn set(&mut self, reference: DocRef, fields: Fields) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.set(reference, fields);
        self.commit(batch)
    }

    pub fn create(&mut self, reference: DocRef, fields: Fields) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.create(reference, fields);
        self.commit(batch)
    }

    pub fn update(&mut self, reference: DocRef, fields: Fields) -> Result<()> {
        let mut batch = WriteBatch::new();
        batch.update(reference, fields);
        self.commit(batch)
    }

    /// Atomically add `by` to a numeric field and return the new value
    pub fn increment(&mut self, reference: DocRef, field: &str, by: f64) -> Result<f64> {
        let mut batch = WriteBatch::new();
        batch.increment(reference.clone(), field, by);
        self.commit(batch)?;
        let doc = self.get(&reference)?.ok_or_else(|| StoreError::NotFound(reference.clone()))?;
        doc.get_f64(field).ok_or(StoreError::NotNumeric {
            reference,
            field: field.to_string(),
        })
    }

    /// Delete a document; returns whether it existed
    pub fn delete(&mut self, reference: DocRef) -> Result<bool> {
        let existed = read_version(&self.conn, &reference)?.is_some();
        let mut batch = WriteBatch::new();
        batch.delete(reference);
        self.commit(batch)?;
        Ok(existed)
    }

    /// Apply a batch atomically. Any failed precondition or write rolls back the whole batch.
    pub fn commit(&mut self, batch: WriteBatch) -> Result<()> {
        debug!(
            writes = batch.writes.len(),
            preconditions = batch.preconditions.len(),
            "commit: called"
        );
        let tx = self.conn.transaction()?;

        for pre in &batch.preconditions {
            let current = read_version(&tx, &pre.reference)?;
            if current != pre.version {
                debug!(reference = %pre.reference, expected = ?pre.version, ?current, "commit: precondition failed");
                return Err(StoreError::Conflict(pre.reference.clone()));
            }
        }

        let now = now_ms();
        for write in batch.writes {
            apply_write(&tx, write, now)?;
        }

        tx.commit()?;
        debug!("commit: applied");
        Ok(())
    }
}

fn apply_write(conn: &Connection, write: Write, now: i64) -> Result<()> {
    match write {
        Write::Set { reference, fields } => match read_doc(conn, &reference)? {
            Some(doc) => put(conn, &reference, doc.version + 1, &fields, doc.created_at, now),
            None => put(conn, &reference, 1, &fields, now, now),
        },
        Write::Create { reference, fields } => {
            if read_version(conn, &reference)?.is_some() {
                return Err(StoreError::AlreadyExists(reference));
            }
            put(conn, &reference, 1, &fields, now, now)
        }
        Write::Update { reference, fields } => {
            let mut doc = read_doc(conn, &reference)?.ok_or_else(|| StoreError::NotFound(reference.clone()))?;
            for (path, value) in fields {
                set_path(&mut doc.fields, &path, value)?;
            }
            put(conn, &reference, doc.version + 1, &doc.fields, doc.created_at, now)
        }
        Write::Increment { reference, field, by } => {
            validate_path(&field)?;
            let mut doc = read_doc(conn, &reference)?.ok_or_else(|| StoreError::NotFound(reference.clone()))?;
            let next = add_number(get_path(&doc.fields, &field), by).ok_or_else(|| StoreError::NotNumeric {
                reference: reference.clone(),
                field: field.clone(),
            })?;
            set_path(&mut doc.fields, &field, next)?;
            put(conn, &reference, doc.version + 1, &doc.fields, doc.created_at, now)
        }
        Write::Delete { reference } => {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![reference.collection(), reference.id()],
            )?;
            Ok(())
        }
    }
}

fn put(conn: &Connection, reference: &DocRef, version: u64, fields: &Fields, created_at: i64, updated_at: i64) -> Result<()> {
    let body = serde_json::to_string(fields)?;
    conn.execute(
        "INSERT INTO documents (collection, id, version, body, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(collection, id) DO UPDATE SET
            version = excluded.version,
            body = excluded.body,
            updated_at = excluded.updated_at",
        params![
            reference.collection(),
            reference.id(),
            version as i64,
            body,
            created_at,
            updated_at
        ],
    )?;
    Ok(())
}

fn read_version(conn: &Connection, reference: &DocRef) -> Result<Option<u64>> {
    let version = conn
        .query_row(
            "SELECT version FROM documents WHERE collection = ?1 AND id = ?2",
            params![reference.collection(), reference.id()],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(version.map(|v| v as u64))
}

fn read_doc(conn: &Connection, reference: &DocRef) -> Result<Option<Document>> {
    let row = conn
        .query_row(
            "SELECT version, body, created_at, updated_at FROM documents WHERE collection = ?1 AND id = ?2",
            params![reference.collection(), reference.id()],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )
        .optional()?;

    row.map(|(version, body, created_at, updated_at)| {
        decode_row(reference.clone(), version, &body, created_at, updated_at)
    })
    .transpose()
}

fn load_collection(conn: &Connection, collection: &str) -> Result<Vec<Document>> {
    let mut stmt = conn.prepare(
        "SELECT id, version, body, created_at, updated_at FROM documents WHERE collection = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![collection], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
            row.get::<_, i64>(4)?,
        ))
    })?;

    let mut docs = Vec::new();
    for row in rows {
        let (id, version, body, created_at, updated_at) = row?;
        docs.push(decode_row(DocRef::new(collection, id), version, &body, created_at, updated_at)?);
    }
    Ok(docs)
}

fn decode_row(reference: DocRef, version: i64, body: &str, created_at: i64, updated_at: i64) -> Result<Document> {
    let fields: Fields = serde_json::from_str(body)?;
    Ok(Document {
        reference,
        version: version as u64,
        fields,
        created_at,
        updated_at,
    })
}
