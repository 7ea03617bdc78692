//! Durable mutation queue
//!
//! Every write that might not have reached the remote backend is recorded
//! here and replayed by the sync manager in enqueue order. The outbox is
//! the only code that changes a `MutationRecord`'s status.
//!
//! `enqueued_at` is strictly increasing across the queue, so ordering by it
//! gives a total FIFO order even when two writes land in the same
//! millisecond.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, warn};

use crate::models::{Container, MutationAction, MutationRecord, MutationStatus, Record};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::local::LocalStore;
use crate::storage::schema::OUTBOX_TABLE;

/// Queue depth by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub failed: u64,
}

/// Handle to the outbox container; cheap to clone
#[derive(Clone)]
pub struct Outbox {
    store: LocalStore,
}

impl Outbox {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Append a pending mutation with a zero retry count
    pub async fn enqueue(
        &self,
        action: MutationAction,
        container: Container,
        payload: Record,
    ) -> StorageResult<MutationRecord> {
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;

                let last: Option<i64> = tx.query_row(
                    &format!("SELECT MAX(enqueued_at) FROM {}", OUTBOX_TABLE),
                    [],
                    |row| row.get(0),
                )?;
                let now = Utc::now().timestamp_millis();
                let enqueued_at = last.map_or(now, |last| now.max(last + 1));

                let entry = MutationRecord {
                    id: uuid::Uuid::new_v4().to_string(),
                    action,
                    container,
                    payload,
                    enqueued_at: from_millis(enqueued_at),
                    status: MutationStatus::Pending,
                    retry_count: 0,
                    last_error: None,
                };

                tx.execute(
                    &format!(
                        "INSERT INTO {} (id, action, container, record_id, owner_id, payload,
                             status, retry_count, last_error, enqueued_at, created_at, updated_at)
                         VALUES (?, ?, ?, ?, ?, ?, ?, 0, NULL, ?, ?, ?)",
                        OUTBOX_TABLE
                    ),
                    params![
                        entry.id,
                        action.as_str(),
                        container.table_name(),
                        entry.payload.id,
                        entry.payload.owner_id,
                        serde_json::to_string(&entry.payload)?,
                        MutationStatus::Pending.as_str(),
                        enqueued_at,
                        enqueued_at,
                        enqueued_at,
                    ],
                )?;
                tx.commit()?;

                debug!(
                    "Queued {} {}/{} as {}",
                    action,
                    container,
                    entry.payload.id,
                    entry.id
                );
                Ok(entry)
            })
            .await
    }

    /// Pending mutations, oldest first
    pub async fn list_pending(&self) -> StorageResult<Vec<MutationRecord>> {
        self.list_by_status(MutationStatus::Pending).await
    }

    /// Quarantined mutations, oldest first
    pub async fn list_failed(&self) -> StorageResult<Vec<MutationRecord>> {
        self.list_by_status(MutationStatus::Failed).await
    }

    async fn list_by_status(&self, status: MutationStatus) -> StorageResult<Vec<MutationRecord>> {
        self.store
            .with_conn(move |conn| {
                let sql = format!(
                    "{} WHERE status = ? ORDER BY enqueued_at ASC, rowid ASC",
                    select_sql()
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(params![status.as_str()], OutboxRow::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows.into_iter().map(OutboxRow::into_mutation).collect()
            })
            .await
    }

    /// Look up one entry by queue id
    pub async fn get(&self, id: &str) -> StorageResult<Option<MutationRecord>> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                let sql = format!("{} WHERE id = ?", select_sql());
                conn.query_row(&sql, params![id], OutboxRow::from_row)
                    .optional()?
                    .map(OutboxRow::into_mutation)
                    .transpose()
            })
            .await
    }

    /// The mutation is reflected remotely; drop it from the queue
    pub async fn mark_completed(&self, id: &str) -> StorageResult<()> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                conn.execute(
                    &format!("DELETE FROM {} WHERE id = ?", OUTBOX_TABLE),
                    params![id],
                )?;
                Ok(())
            })
            .await
    }

    /// Quarantine an entry; it is kept but never replayed again
    pub async fn mark_failed(&self, id: &str, reason: &str) -> StorageResult<()> {
        let id = id.to_string();
        let reason = reason.to_string();
        self.store
            .with_conn(move |conn| {
                let changed = set_status(conn, &id, MutationStatus::Failed, Some(&reason))?;
                if !changed {
                    warn!("mark_failed: outbox entry {} does not exist", id);
                }
                Ok(())
            })
            .await
    }

    /// Bump the retry count and remember the error; returns the new count
    pub async fn increment_retry(&self, id: &str, error: &str) -> StorageResult<u32> {
        let id = id.to_string();
        let error = error.to_string();
        self.store
            .with_conn(move |conn| {
                let now = Utc::now().timestamp_millis();
                let count: Option<i64> = conn
                    .query_row(
                        &format!(
                            "UPDATE {} SET retry_count = retry_count + 1, last_error = ?, updated_at = ?
                             WHERE id = ? RETURNING retry_count",
                            OUTBOX_TABLE
                        ),
                        params![error, now, id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(count.unwrap_or(0) as u32)
            })
            .await
    }

    /// Whether any pending entry targets this record
    pub async fn has_pending(&self, container: Container, record_id: &str) -> StorageResult<bool> {
        let record_id = record_id.to_string();
        self.store
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT 1 FROM {} WHERE container = ? AND record_id = ? AND status = ?",
                    OUTBOX_TABLE
                );
                Ok(conn.prepare(&sql)?.exists(params![
                    container.table_name(),
                    record_id,
                    MutationStatus::Pending.as_str()
                ])?)
            })
            .await
    }

    /// Ids of records in `container` with at least one pending entry
    pub async fn pending_record_ids(&self, container: Container) -> StorageResult<HashSet<String>> {
        self.store
            .with_conn(move |conn| {
                let sql = format!(
                    "SELECT DISTINCT record_id FROM {} WHERE container = ? AND status = ?",
                    OUTBOX_TABLE
                );
                let mut stmt = conn.prepare(&sql)?;
                let ids = stmt
                    .query_map(
                        params![container.table_name(), MutationStatus::Pending.as_str()],
                        |row| row.get::<_, String>(0),
                    )?
                    .collect::<Result<HashSet<_>, _>>()?;
                Ok(ids)
            })
            .await
    }

    pub async fn stats(&self) -> StorageResult<OutboxStats> {
        self.store
            .with_conn(|conn| {
                let sql = format!(
                    "SELECT
                        COALESCE(SUM(status = 'pending'), 0),
                        COALESCE(SUM(status = 'failed'), 0)
                     FROM {}",
                    OUTBOX_TABLE
                );
                let (pending, failed): (i64, i64) =
                    conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(OutboxStats {
                    pending: pending as u64,
                    failed: failed as u64,
                })
            })
            .await
    }

    /// Operator action: put a failed entry back in the queue
    ///
    /// The retry count is reset. The entry keeps its original position.
    pub async fn requeue(&self, id: &str) -> StorageResult<bool> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                let now = Utc::now().timestamp_millis();
                let changed = conn.execute(
                    &format!(
                        "UPDATE {} SET status = ?, retry_count = 0, updated_at = ?
                         WHERE id = ? AND status = ?",
                        OUTBOX_TABLE
                    ),
                    params![
                        MutationStatus::Pending.as_str(),
                        now,
                        id,
                        MutationStatus::Failed.as_str()
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
    }

    /// Operator action: drop a failed entry without replaying it
    pub async fn discard(&self, id: &str) -> StorageResult<bool> {
        let id = id.to_string();
        self.store
            .with_conn(move |conn| {
                let removed = conn.execute(
                    &format!("DELETE FROM {} WHERE id = ? AND status = ?", OUTBOX_TABLE),
                    params![id, MutationStatus::Failed.as_str()],
                )?;
                Ok(removed > 0)
            })
            .await
    }
}

fn set_status(
    conn: &Connection,
    id: &str,
    status: MutationStatus,
    reason: Option<&str>,
) -> StorageResult<bool> {
    let now = Utc::now().timestamp_millis();
    let changed = conn.execute(
        &format!(
            "UPDATE {} SET status = ?, last_error = COALESCE(?, last_error), updated_at = ?
             WHERE id = ?",
            OUTBOX_TABLE
        ),
        params![status.as_str(), reason, now, id],
    )?;
    Ok(changed > 0)
}

fn select_sql() -> String {
    format!(
        "SELECT id, action, container, payload, status, retry_count, last_error, enqueued_at
         FROM {}",
        OUTBOX_TABLE
    )
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

struct OutboxRow {
    id: String,
    action: String,
    container: String,
    payload: String,
    status: String,
    retry_count: i64,
    last_error: Option<String>,
    enqueued_at: i64,
}

impl OutboxRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            action: row.get(1)?,
            container: row.get(2)?,
            payload: row.get(3)?,
            status: row.get(4)?,
            retry_count: row.get(5)?,
            last_error: row.get(6)?,
            enqueued_at: row.get(7)?,
        })
    }

    fn into_mutation(self) -> StorageResult<MutationRecord> {
        let corrupt = |details: String| StorageError::Corrupt {
            container: OUTBOX_TABLE.to_string(),
            id: self.id.clone(),
            details,
        };

        let action: MutationAction = self.action.parse().map_err(|e| corrupt(format!("{}", e)))?;
        let container: Container = self
            .container
            .parse()
            .map_err(|e| corrupt(format!("{}", e)))?;
        let status: MutationStatus = self.status.parse().map_err(|e| corrupt(format!("{}", e)))?;
        let payload: Record =
            serde_json::from_str(&self.payload).map_err(|e| corrupt(e.to_string()))?;

        Ok(MutationRecord {
            id: self.id.clone(),
            action,
            container,
            payload,
            enqueued_at: from_millis(self.enqueued_at),
            status,
            retry_count: self.retry_count.max(0) as u32,
            last_error: self.last_error.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn outbox() -> Outbox {
        Outbox::new(LocalStore::open_in_memory().await.unwrap())
    }

    fn customer(id: &str) -> Record {
        Record::with_id(id, "u1").with_field("name", "Ravi")
    }

    #[tokio::test]
    async fn test_enqueue_starts_pending() {
        let outbox = outbox().await;
        let entry = outbox
            .enqueue(MutationAction::Create, Container::Customers, customer("1"))
            .await
            .unwrap();

        assert_eq!(entry.status, MutationStatus::Pending);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(entry.record_id(), "1");

        let found = outbox.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(found, entry);
    }

    #[tokio::test]
    async fn test_list_pending_is_fifo() {
        let outbox = outbox().await;
        let a = outbox
            .enqueue(MutationAction::Create, Container::Customers, customer("1"))
            .await
            .unwrap();
        let b = outbox
            .enqueue(MutationAction::Update, Container::Customers, customer("1"))
            .await
            .unwrap();
        let c = outbox
            .enqueue(
                MutationAction::Delete,
                Container::Customers,
                Record::tombstone("1", "u1"),
            )
            .await
            .unwrap();

        let pending = outbox.list_pending().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), b.id.as_str(), c.id.as_str()]);
        assert!(a.enqueued_at < b.enqueued_at);
        assert!(b.enqueued_at < c.enqueued_at);
        assert_eq!(pending[2].action, MutationAction::Delete);
        assert!(pending[2].payload.fields.is_empty());
    }

    #[tokio::test]
    async fn test_mark_completed_removes_entry() {
        let outbox = outbox().await;
        let entry = outbox
            .enqueue(MutationAction::Create, Container::Jobs, customer("j"))
            .await
            .unwrap();

        outbox.mark_completed(&entry.id).await.unwrap();
        assert!(outbox.get(&entry.id).await.unwrap().is_none());
        assert!(outbox.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_entries_leave_pending_list() {
        let outbox = outbox().await;
        let entry = outbox
            .enqueue(MutationAction::Update, Container::Vendors, customer("v"))
            .await
            .unwrap();

        outbox.mark_failed(&entry.id, "rejected (422)").await.unwrap();

        assert!(outbox.list_pending().await.unwrap().is_empty());
        let failed = outbox.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].last_error.as_deref(), Some("rejected (422)"));
        assert_eq!(
            outbox.stats().await.unwrap(),
            OutboxStats {
                pending: 0,
                failed: 1
            }
        );
    }

    #[tokio::test]
    async fn test_increment_retry_counts_up() {
        let outbox = outbox().await;
        let entry = outbox
            .enqueue(MutationAction::Create, Container::Customers, customer("1"))
            .await
            .unwrap();

        assert_eq!(outbox.increment_retry(&entry.id, "timeout").await.unwrap(), 1);
        assert_eq!(outbox.increment_retry(&entry.id, "timeout").await.unwrap(), 2);
        assert_eq!(outbox.increment_retry("missing", "timeout").await.unwrap(), 0);

        let found = outbox.get(&entry.id).await.unwrap().unwrap();
        assert_eq!(found.retry_count, 2);
        assert_eq!(found.status, MutationStatus::Pending);
        assert_eq!(found.last_error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn test_pending_record_ids_excludes_failed() {
        let outbox = outbox().await;
        outbox
            .enqueue(MutationAction::Update, Container::Customers, customer("a"))
            .await
            .unwrap();
        let failed = outbox
            .enqueue(MutationAction::Update, Container::Customers, customer("b"))
            .await
            .unwrap();
        outbox
            .enqueue(MutationAction::Update, Container::Vendors, customer("c"))
            .await
            .unwrap();
        outbox.mark_failed(&failed.id, "bad").await.unwrap();

        let ids = outbox.pending_record_ids(Container::Customers).await.unwrap();
        assert_eq!(ids, HashSet::from(["a".to_string()]));
        assert!(outbox.has_pending(Container::Vendors, "c").await.unwrap());
        assert!(!outbox.has_pending(Container::Customers, "b").await.unwrap());
    }

    #[tokio::test]
    async fn test_requeue_and_discard_only_touch_failed() {
        let outbox = outbox().await;
        let pending = outbox
            .enqueue(MutationAction::Create, Container::Customers, customer("1"))
            .await
            .unwrap();
        let failed = outbox
            .enqueue(MutationAction::Create, Container::Customers, customer("2"))
            .await
            .unwrap();
        outbox.increment_retry(&failed.id, "timeout").await.unwrap();
        outbox.mark_failed(&failed.id, "gave up").await.unwrap();

        assert!(!outbox.discard(&pending.id).await.unwrap());
        assert!(!outbox.requeue(&pending.id).await.unwrap());

        assert!(outbox.requeue(&failed.id).await.unwrap());
        let requeued = outbox.get(&failed.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, MutationStatus::Pending);
        assert_eq!(requeued.retry_count, 0);

        outbox.mark_failed(&failed.id, "again").await.unwrap();
        assert!(outbox.discard(&failed.id).await.unwrap());
        assert!(outbox.get(&failed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("garage.db");

        {
            let outbox = Outbox::new(LocalStore::open(&path).await.unwrap());
            outbox
                .enqueue(
                    MutationAction::Create,
                    Container::LedgerEntries,
                    Record::with_id("l-1", "u1").with_field("amount", json!(1500)),
                )
                .await
                .unwrap();
        }

        let outbox = Outbox::new(LocalStore::open(&path).await.unwrap());
        let pending = outbox.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].container, Container::LedgerEntries);
        assert_eq!(pending[0].payload.get("amount"), Some(&json!(1500)));
    }

    #[tokio::test]
    async fn test_clear_all_empties_outbox() {
        let store = LocalStore::open_in_memory().await.unwrap();
        let outbox = Outbox::new(store.clone());
        outbox
            .enqueue(MutationAction::Create, Container::Customers, customer("1"))
            .await
            .unwrap();

        store.clear_all().await.unwrap();
        assert_eq!(outbox.stats().await.unwrap(), OutboxStats::default());
    }
}
