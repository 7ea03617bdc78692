//! Data façade
//!
//! The `Store` is the single entry point application code calls. Every
//! call is served by the local store first and returns without waiting on
//! the network; the remote side is handled by the sync manager.
//!
//! ## Write paths
//!
//! Each mutation picks a path through [`resolve_write_path`]:
//! - **Immediate**: the remote is reachable; the write is handed to the
//!   write-through worker and falls back to the outbox if it fails
//! - **Buffered**: the remote is unreachable; the write goes to the outbox
//!
//! Mutations run one at a time. The local write and the hand-off happen
//! under one gate, so the remote sees changes in local write order.
//!
//! ## Usage
//!
//! ```ignore
//! let store = Store::open(&config).await?;
//!
//! let ravi = store.create(Container::Customers, data, "u1").await?;
//! let customers = store.read(Container::Customers, "u1").await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::models::{Container, MutationAction, Record};
use crate::remote::{HttpBackend, RemoteBackend};
use crate::storage::{LocalStore, Outbox, StorageError, StorageResult};
use crate::sync::{Connectivity, SyncManager, SyncSettings};

/// Where a façade mutation goes after the local write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePath {
    /// Write through to the remote now, outbox on failure
    Immediate,
    /// Queue in the outbox for the next drain
    Buffered,
}

/// The one place the online/offline branch is decided
pub fn resolve_write_path(remote_reachable: bool) -> WritePath {
    if remote_reachable {
        WritePath::Immediate
    } else {
        WritePath::Buffered
    }
}

/// Offline-first record store
#[derive(Clone)]
pub struct Store {
    local: LocalStore,
    sync: SyncManager,
    refresh_on_read: bool,
}

impl Store {
    /// Open the store described by `config`
    ///
    /// A remote backend is attached only when sync is enabled and a remote
    /// URL is set; the store then starts out online.
    pub async fn open(config: &Config) -> Result<Self> {
        let remote: Option<Arc<dyn RemoteBackend>> = match config.active_remote_url() {
            Some(url) => {
                let backend =
                    HttpBackend::new(url, config.remote_api_key.clone(), config.request_timeout())
                        .context("Failed to create remote client")?;
                Some(Arc::new(backend))
            }
            None => None,
        };
        let connectivity = Connectivity::new(remote.is_some());

        Self::open_at(
            Some(config.sqlite_path()),
            remote,
            connectivity,
            config.sync_settings(),
        )
        .await
        .context("Failed to open local store")
    }

    /// Open with explicit parts; `path = None` keeps data in memory
    ///
    /// If the database at `path` is unavailable the store keeps working on
    /// an in-memory database for this session; see [`Store::is_durable`].
    pub async fn open_at(
        path: Option<PathBuf>,
        remote: Option<Arc<dyn RemoteBackend>>,
        connectivity: Connectivity,
        settings: SyncSettings,
    ) -> StorageResult<Self> {
        let local = match path {
            Some(path) => match LocalStore::open(path).await {
                Ok(local) => local,
                Err(e) if e.is_unavailable() => {
                    error!("{}", e);
                    if let Some(hint) = e.recovery_suggestion() {
                        error!("{}", hint);
                    }
                    LocalStore::open_in_memory().await?
                }
                Err(e) => return Err(e),
            },
            None => LocalStore::open_in_memory().await?,
        };

        let store = Self::new(local, remote, connectivity, settings);
        store.sync.refresh_health().await;
        Ok(store)
    }

    /// Wrap an already open local store
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        local: LocalStore,
        remote: Option<Arc<dyn RemoteBackend>>,
        connectivity: Connectivity,
        settings: SyncSettings,
    ) -> Self {
        let sync = SyncManager::new(local.clone(), remote, connectivity, settings);
        Self {
            local,
            sync,
            refresh_on_read: true,
        }
    }

    /// Whether `read` starts a background refresh from the remote
    pub fn with_refresh_on_read(mut self, enabled: bool) -> Self {
        self.refresh_on_read = enabled;
        self
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    pub fn sync(&self) -> &SyncManager {
        &self.sync
    }

    pub fn outbox(&self) -> &Outbox {
        self.sync.outbox()
    }

    /// `false` when running on the in-memory fallback
    pub fn is_durable(&self) -> bool {
        self.local.is_durable()
    }

    pub fn write_path(&self) -> WritePath {
        resolve_write_path(self.sync.is_remote_reachable())
    }

    // ==================== Mutations ====================

    /// Create a record from `data`, assigning an id if it has none
    ///
    /// Fails with `DuplicateKey` if a record with the supplied id exists.
    pub async fn create(
        &self,
        container: Container,
        data: Map<String, Value>,
        owner_id: &str,
    ) -> StorageResult<Record> {
        let record = Record::from_data(data, owner_id);

        let _gate = self.sync.write_gate().await;
        let stored = self.local.add(container, record).await?;
        self.sync
            .submit(
                self.write_path(),
                MutationAction::Create,
                container,
                stored.clone(),
            )
            .await?;

        debug!("Created {}/{}", container, stored.id);
        Ok(stored)
    }

    /// Merge `patch` onto an existing record
    ///
    /// Fails with `NotFound` if the record does not exist locally or
    /// belongs to another owner.
    pub async fn update(
        &self,
        container: Container,
        id: &str,
        patch: Map<String, Value>,
        owner_id: &str,
    ) -> StorageResult<Record> {
        let _gate = self.sync.write_gate().await;

        let mut record = self
            .local
            .get(container, id)
            .await?
            .filter(|r| r.owner_id == owner_id)
            .ok_or_else(|| StorageError::NotFound {
                container,
                id: id.to_string(),
            })?;
        record.merge(patch);

        let stored = self.local.put(container, record).await?;
        self.sync
            .submit(
                self.write_path(),
                MutationAction::Update,
                container,
                stored.clone(),
            )
            .await?;

        debug!("Updated {}/{}", container, stored.id);
        Ok(stored)
    }

    /// Delete a record locally and remotely
    ///
    /// Returns whether a local record was removed. The remote delete is
    /// queued even when the record is not present locally. A local record
    /// owned by someone else is left alone.
    pub async fn remove(
        &self,
        container: Container,
        id: &str,
        owner_id: &str,
    ) -> StorageResult<bool> {
        let _gate = self.sync.write_gate().await;

        if let Some(existing) = self.local.get(container, id).await? {
            if existing.owner_id != owner_id {
                return Ok(false);
            }
        }

        let removed = self.local.delete(container, id).await?;
        self.sync
            .submit(
                self.write_path(),
                MutationAction::Delete,
                container,
                Record::tombstone(id, owner_id),
            )
            .await?;

        debug!("Removed {}/{}", container, id);
        Ok(removed)
    }

    // ==================== Reads ====================

    /// Every local record of `owner_id` in `container`
    ///
    /// When the remote is reachable a refresh of the container is started
    /// in the background; this call never waits for it.
    pub async fn read(&self, container: Container, owner_id: &str) -> StorageResult<Vec<Record>> {
        let records = self.local.get_all_by_owner(container, owner_id).await?;

        if self.refresh_on_read && self.sync.is_remote_reachable() {
            let sync = self.sync.clone();
            let owner_id = owner_id.to_string();
            tokio::spawn(async move {
                if let Some(pulled) = sync.refresh_container(container, &owner_id).await {
                    debug!(
                        "Background refresh of {}: {} applied, {} kept local",
                        container, pulled.applied, pulled.protected
                    );
                }
            });
        }

        Ok(records)
    }

    /// One local record by id
    pub async fn read_one(&self, container: Container, id: &str) -> StorageResult<Option<Record>> {
        self.local.get(container, id).await
    }

    /// Number of local records in `container`
    pub async fn count(&self, container: Container) -> StorageResult<u64> {
        self.local.count(container).await
    }

    /// Wait for queued write-throughs, then stop the auto-sync timer
    pub async fn close(&self) {
        self.sync.flush().await;
        self.sync.stop_auto_sync();
        info!("Store closed");
    }
}
