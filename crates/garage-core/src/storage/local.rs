//! Local record store
//!
//! A transactional, container-partitioned store on top of SQLite. Every
//! operation is async: the SQLite work runs on Tokio's blocking pool
//! behind a single connection, so writes are serialized by the
//! connection lock and the engine's transactions.
//!
//! ## Timestamps
//!
//! `put` always stamps `updated_at`, and the stamp is strictly greater
//! than the previous one for the same record even if the wall clock has
//! not moved. `created_at` is written once and never changed afterwards.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::models::{Container, Record};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::schema::{init_schema, needs_init, OUTBOX_TABLE};

/// Secondary index lookup (exact match)
#[derive(Debug, Clone, PartialEq)]
pub enum IndexKey {
    Owner(String),
    UpdatedAt(DateTime<Utc>),
    CreatedAt(DateTime<Utc>),
}

impl IndexKey {
    fn column(&self) -> &'static str {
        match self {
            IndexKey::Owner(_) => "owner_id",
            IndexKey::UpdatedAt(_) => "updated_at",
            IndexKey::CreatedAt(_) => "created_at",
        }
    }

    fn value(&self) -> rusqlite::types::Value {
        match self {
            IndexKey::Owner(owner) => owner.clone().into(),
            IndexKey::UpdatedAt(ts) | IndexKey::CreatedAt(ts) => ts.timestamp_millis().into(),
        }
    }
}

/// A record `bulk_put` could not apply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkPutFailure {
    pub id: String,
    pub error: String,
}

/// Outcome of a `bulk_put`; records are applied one by one
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BulkPutReport {
    pub applied: usize,
    pub failures: Vec<BulkPutFailure>,
}

impl BulkPutReport {
    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// Handle to the local store; cheap to clone
#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

struct Inner {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open or create the store at `path`
    ///
    /// Creates the parent directory and all containers on first use.
    /// Any failure here is reported as `StorageError::Unavailable`.
    pub async fn open(path: impl Into<PathBuf>) -> StorageResult<Self> {
        let path = path.into();
        let open_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || open_connection(&open_path))
            .await
            .map_err(|e| StorageError::Background(e.to_string()))??;

        info!("Local store opened at {:?}", path);
        Ok(Self::from_connection(conn, Some(path)))
    }

    /// Open a store that lives only as long as this process
    pub async fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::from_open(e, PathBuf::from(":memory:")))?;
        init_schema(&conn)?;
        debug!("In-memory local store opened");
        Ok(Self::from_connection(conn, None))
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                path,
            }),
        }
    }

    /// Database file location, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    /// Whether data survives a restart
    pub fn is_durable(&self) -> bool {
        self.inner.path.is_some()
    }

    /// (Re)create any missing containers; idempotent
    pub async fn init(&self) -> StorageResult<()> {
        self.with_conn(|conn| {
            init_schema(conn)?;
            Ok(())
        })
        .await
    }

    /// Run `f` against the connection on the blocking pool
    pub(crate) async fn with_conn<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || {
            let mut conn = inner
                .conn
                .lock()
                .map_err(|_| StorageError::Background("connection lock poisoned".to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Background(e.to_string()))?
    }

    // ==================== Reads ====================

    /// Get a record by id
    pub async fn get(&self, container: Container, id: &str) -> StorageResult<Option<Record>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("{} WHERE id = ?", select_sql(container));
            let row = conn
                .query_row(&sql, params![id], RecordRow::from_row)
                .optional()?;
            row.map(|r| r.into_record(container)).transpose()
        })
        .await
    }

    /// Get every record in a container regardless of owner
    pub async fn get_all(&self, container: Container) -> StorageResult<Vec<Record>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&select_sql(container))?;
            let rows = stmt
                .query_map([], RecordRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(|r| r.into_record(container)).collect()
        })
        .await
    }

    /// Get all records belonging to `owner_id`
    pub async fn get_all_by_owner(
        &self,
        container: Container,
        owner_id: &str,
    ) -> StorageResult<Vec<Record>> {
        self.get_all_by_index(container, IndexKey::Owner(owner_id.to_string()))
            .await
    }

    /// Get all records whose indexed column equals the key
    pub async fn get_all_by_index(
        &self,
        container: Container,
        key: IndexKey,
    ) -> StorageResult<Vec<Record>> {
        self.with_conn(move |conn| {
            let sql = format!("{} WHERE {} = ?", select_sql(container), key.column());
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![key.value()], RecordRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(|r| r.into_record(container)).collect()
        })
        .await
    }

    /// Number of records in a container
    pub async fn count(&self, container: Container) -> StorageResult<u64> {
        self.with_conn(move |conn| {
            let sql = format!("SELECT COUNT(*) FROM {}", container.table_name());
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    // ==================== Writes ====================

    /// Upsert by id, returning the record as stored
    pub async fn put(&self, container: Container, record: Record) -> StorageResult<Record> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let stored = put_record(&tx, container, record)?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// Insert-only write; fails with `DuplicateKey` if the id exists
    pub async fn add(&self, container: Container, record: Record) -> StorageResult<Record> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            if record_exists(&tx, container, &record.id)? {
                return Err(StorageError::DuplicateKey {
                    container,
                    id: record.id,
                });
            }
            let stored = put_record(&tx, container, record)?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    /// Delete by id; returns whether a record was removed
    ///
    /// Deleting an unknown id is not an error.
    pub async fn delete(&self, container: Container, id: &str) -> StorageResult<bool> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("DELETE FROM {} WHERE id = ?", container.table_name());
            let removed = conn.execute(&sql, params![id])?;
            Ok(removed > 0)
        })
        .await
    }

    /// Apply `put` to each record, each one atomically
    ///
    /// A record that fails is rolled back on its own and reported in the
    /// returned `BulkPutReport`; the rest are still applied.
    pub async fn bulk_put(
        &self,
        container: Container,
        records: Vec<Record>,
    ) -> StorageResult<BulkPutReport> {
        self.with_conn(move |conn| {
            let mut report = BulkPutReport::default();
            let mut tx = conn.transaction()?;

            for record in records {
                let id = record.id.clone();
                let sp = tx.savepoint()?;
                match put_record(&sp, container, record) {
                    Ok(_) => {
                        sp.commit()?;
                        report.applied += 1;
                    }
                    Err(e) => {
                        // Dropping the savepoint rolls this record back
                        drop(sp);
                        report.failures.push(BulkPutFailure {
                            id,
                            error: e.to_string(),
                        });
                    }
                }
            }

            tx.commit()?;
            Ok(report)
        })
        .await
    }

    /// Remove every record from one container
    pub async fn clear(&self, container: Container) -> StorageResult<()> {
        self.with_conn(move |conn| {
            conn.execute(&format!("DELETE FROM {}", container.table_name()), [])?;
            Ok(())
        })
        .await
    }

    /// Remove every record from every container, the outbox included
    pub async fn clear_all(&self) -> StorageResult<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            for container in Container::ALL {
                tx.execute(&format!("DELETE FROM {}", container.table_name()), [])?;
            }
            tx.execute(&format!("DELETE FROM {}", OUTBOX_TABLE), [])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}

fn open_connection(path: &Path) -> StorageResult<Connection> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
    }

    let conn = Connection::open(path).map_err(|e| StorageError::from_open(e, path.to_path_buf()))?;
    conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        .map_err(|e| StorageError::from_open(e, path.to_path_buf()))?;

    if needs_init(&conn) {
        init_schema(&conn).map_err(|e| StorageError::from_open(e, path.to_path_buf()))?;
    }
    Ok(conn)
}

// ==================== Row helpers ====================

fn select_sql(container: Container) -> String {
    format!(
        "SELECT id, owner_id, data, created_at, updated_at FROM {}",
        container.table_name()
    )
}

struct RecordRow {
    id: String,
    owner_id: String,
    data: String,
    created_at: i64,
    updated_at: i64,
}

impl RecordRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            data: row.get(2)?,
            created_at: row.get(3)?,
            updated_at: row.get(4)?,
        })
    }

    fn into_record(self, container: Container) -> StorageResult<Record> {
        let fields: Map<String, Value> =
            serde_json::from_str(&self.data).map_err(|e| StorageError::Corrupt {
                container: container.to_string(),
                id: self.id.clone(),
                details: e.to_string(),
            })?;
        Ok(Record {
            id: self.id,
            owner_id: self.owner_id,
            created_at: DateTime::from_timestamp_millis(self.created_at),
            updated_at: DateTime::from_timestamp_millis(self.updated_at),
            fields,
        })
    }
}

fn record_exists(conn: &Connection, container: Container, id: &str) -> StorageResult<bool> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", container.table_name());
    Ok(conn.prepare(&sql)?.exists(params![id])?)
}

/// Upsert one record inside an open transaction or savepoint
fn put_record(tx: &Connection, container: Container, mut record: Record) -> StorageResult<Record> {
    if record.id.is_empty() {
        return Err(StorageError::Corrupt {
            container: container.to_string(),
            id: String::new(),
            details: "record has no id".to_string(),
        });
    }

    let table = container.table_name();
    let existing: Option<(i64, i64)> = tx
        .query_row(
            &format!("SELECT created_at, updated_at FROM {} WHERE id = ?", table),
            params![record.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let now = Utc::now().timestamp_millis();
    let updated_at = match existing {
        Some((_, previous)) => now.max(previous + 1),
        None => now,
    };
    let created_at = existing
        .map(|(created, _)| created)
        .or_else(|| record.created_at.map(|ts| ts.timestamp_millis()))
        .unwrap_or(updated_at);

    let data = serde_json::to_string(&record.fields)?;
    tx.execute(
        &format!(
            "INSERT INTO {} (id, owner_id, data, created_at, updated_at) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                owner_id = excluded.owner_id,
                data = excluded.data,
                updated_at = excluded.updated_at",
            table
        ),
        params![record.id, record.owner_id, data, created_at, updated_at],
    )?;

    record.created_at = DateTime::from_timestamp_millis(created_at);
    record.updated_at = DateTime::from_timestamp_millis(updated_at);
    Ok(record)
}
