//! In-process remote backend
//!
//! Keeps remote tables in memory. Faults can be injected for every call or
//! for calls touching one record id, and an artificial latency makes
//! overlapping calls observable. Every call is logged in order.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{RemoteBackend, RemoteError, RemoteResult};
use crate::models::{Container, Record};

/// Which backend operation a logged call was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOp {
    Insert,
    Upsert,
    Delete,
    SelectAll,
}

/// One logged backend call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCall {
    pub op: RemoteOp,
    pub container: Container,
    /// Target record, `None` for `SelectAll`
    pub record_id: Option<String>,
}

#[derive(Default)]
struct State {
    tables: HashMap<Container, HashMap<String, Record>>,
    fail_all: Option<RemoteError>,
    fail_records: HashMap<String, RemoteError>,
    latency: Option<Duration>,
    calls: Vec<RemoteCall>,
}

/// Remote backend backed by in-memory maps
#[derive(Default)]
pub struct MemoryBackend {
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain maps behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fail every call with `error` until cleared with `None`
    pub fn set_fail_all(&self, error: Option<RemoteError>) {
        self.state().fail_all = error;
    }

    /// Fail every call that targets `record_id`
    pub fn fail_record(&self, record_id: impl Into<String>, error: RemoteError) {
        self.state().fail_records.insert(record_id.into(), error);
    }

    pub fn clear_failure(&self, record_id: &str) {
        self.state().fail_records.remove(record_id);
    }

    /// Delay every call before it touches the tables
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Place a record directly in a remote table, bypassing faults and the log
    pub fn seed(&self, container: Container, record: Record) {
        self.state()
            .tables
            .entry(container)
            .or_default()
            .insert(record.id.clone(), record);
    }

    pub fn get(&self, container: Container, id: &str) -> Option<Record> {
        self.state()
            .tables
            .get(&container)
            .and_then(|table| table.get(id))
            .cloned()
    }

    /// Every record in a remote table, sorted by id
    pub fn records(&self, container: Container) -> Vec<Record> {
        let mut records: Vec<Record> = self
            .state()
            .tables
            .get(&container)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Calls made so far, oldest first
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    /// Calls of one kind that targeted `record_id`
    pub fn call_count(&self, op: RemoteOp, record_id: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| call.op == op && call.record_id.as_deref() == Some(record_id))
            .count()
    }

    /// Wait out the latency, log the call, and check injected faults
    async fn begin(
        &self,
        op: RemoteOp,
        container: Container,
        record_id: Option<&str>,
    ) -> RemoteResult<()> {
        let latency = self.state().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state();
        state.calls.push(RemoteCall {
            op,
            container,
            record_id: record_id.map(str::to_string),
        });
        if let Some(error) = &state.fail_all {
            return Err(error.clone());
        }
        if let Some(error) = record_id.and_then(|id| state.fail_records.get(id)) {
            return Err(error.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn insert(&self, container: Container, record: &Record) -> RemoteResult<()> {
        self.begin(RemoteOp::Insert, container, Some(&record.id))
            .await?;

        let mut state = self.state();
        let table = state.tables.entry(container).or_default();
        if table.contains_key(&record.id) {
            return Err(RemoteError::Conflict);
        }
        table.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn upsert(&self, container: Container, record: &Record) -> RemoteResult<()> {
        self.begin(RemoteOp::Upsert, container, Some(&record.id))
            .await?;

        self.state()
            .tables
            .entry(container)
            .or_default()
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn delete_where(
        &self,
        container: Container,
        id: &str,
        owner_id: &str,
    ) -> RemoteResult<()> {
        self.begin(RemoteOp::Delete, container, Some(id)).await?;

        let mut state = self.state();
        let table = state.tables.entry(container).or_default();
        let owned = table.get(id).is_some_and(|r| r.owner_id == owner_id);
        if !owned {
            return Err(RemoteError::NotFound);
        }
        table.remove(id);
        Ok(())
    }

    async fn select_all(&self, container: Container, owner_id: &str) -> RemoteResult<Vec<Record>> {
        self.begin(RemoteOp::SelectAll, container, None).await?;

        let mut records: Vec<Record> = self
            .state()
            .tables
            .get(&container)
            .map(|table| {
                table
                    .values()
                    .filter(|r| r.owner_id == owner_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, owner: &str) -> Record {
        Record::with_id(id, owner).with_field("name", id)
    }

    #[tokio::test]
    async fn test_insert_conflicts_on_existing_id() {
        let backend = MemoryBackend::new();
        backend
            .insert(Container::Customers, &record("a", "u1"))
            .await
            .unwrap();

        let err = backend
            .insert(Container::Customers, &record("a", "u1"))
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::Conflict);

        backend
            .upsert(Container::Customers, &record("a", "u1").with_field("vip", true))
            .await
            .unwrap();
        assert_eq!(backend.records(Container::Customers).len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_owner_scoped() {
        let backend = MemoryBackend::new();
        backend.seed(Container::Jobs, record("j", "u1"));

        let err = backend
            .delete_where(Container::Jobs, "j", "u2")
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::NotFound);
        assert!(backend.get(Container::Jobs, "j").is_some());

        backend.delete_where(Container::Jobs, "j", "u1").await.unwrap();
        assert!(backend.get(Container::Jobs, "j").is_none());
    }

    #[tokio::test]
    async fn test_select_all_filters_owner() {
        let backend = MemoryBackend::new();
        backend.seed(Container::Vendors, record("a", "u1"));
        backend.seed(Container::Vendors, record("b", "u2"));

        let mine = backend.select_all(Container::Vendors, "u1").await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, "a");
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let backend = MemoryBackend::new();
        backend.fail_record("bad", RemoteError::Rejected {
            status: 422,
            message: "invalid".into(),
        });

        assert!(backend
            .upsert(Container::Customers, &record("bad", "u1"))
            .await
            .is_err());
        assert!(backend
            .upsert(Container::Customers, &record("good", "u1"))
            .await
            .is_ok());

        backend.set_fail_all(Some(RemoteError::Timeout));
        assert_eq!(
            backend
                .upsert(Container::Customers, &record("good", "u1"))
                .await
                .unwrap_err(),
            RemoteError::Timeout
        );

        backend.set_fail_all(None);
        backend.clear_failure("bad");
        backend
            .upsert(Container::Customers, &record("bad", "u1"))
            .await
            .unwrap();

        assert_eq!(backend.call_count(RemoteOp::Upsert, "bad"), 2);
        assert_eq!(backend.calls().len(), 4);
    }
}
