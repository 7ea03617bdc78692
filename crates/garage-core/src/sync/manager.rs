//! Sync manager
//!
//! Bridges the local store and outbox to the remote backend, and is the
//! only component that does network I/O.
//!
//! ## Responsibilities
//!
//! - **Drain**: replay pending outbox entries in FIFO order. At most one
//!   drain runs at a time; a second call while one is in progress returns
//!   immediately.
//! - **Pull**: full-snapshot refresh of every container for one owner.
//!   Records with pending outbox entries or write-throughs in flight are
//!   left alone so an unsent local edit is never overwritten.
//! - **Write-through**: façade writes on the immediate path are handed to a
//!   single background worker, in order. Anything the worker cannot apply
//!   remotely lands in the outbox.
//! - **Auto-sync**: a periodic timer that drains (never pulls).
//! - **Health**: a `watch` channel telling the UI whether everything is
//!   synced, pending, or needs attention.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{
    mpsc, watch, Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, RwLock, RwLockReadGuard,
};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::connectivity::{Connectivity, ListenerId};
use crate::models::{Container, MutationAction, MutationRecord, Record};
use crate::remote::{RemoteBackend, RemoteError, RemoteResult};
use crate::storage::{BulkPutFailure, LocalStore, Outbox, StorageResult};
use crate::store::WritePath;

/// Transient failures allowed before a mutation is quarantined
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default period of the auto-sync timer
pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Tunables for replay and the auto-sync timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
    /// A mutation is marked failed once its retry count reaches this
    pub max_retries: u32,
    pub auto_sync_interval: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            auto_sync_interval: DEFAULT_AUTO_SYNC_INTERVAL,
        }
    }
}

/// Drain state machine: `Idle -> Draining -> Idle`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DrainState {
    Idle = 0,
    Draining = 1,
}

/// Held for the duration of one drain; returns the state to `Idle` on drop
struct DrainGuard<'a> {
    state: &'a AtomicU8,
}

impl<'a> DrainGuard<'a> {
    fn acquire(state: &'a AtomicU8) -> Option<Self> {
        state
            .compare_exchange(
                DrainState::Idle as u8,
                DrainState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok()
            .map(|_| Self { state })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.state.store(DrainState::Idle as u8, Ordering::Release);
    }
}

/// What the user should be shown about unsent changes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SyncHealth {
    /// All changes synced
    Synced,
    /// Changes pending
    Pending { pending: u64 },
    /// Sync failed for some changes; an operator has to look at them
    NeedsAttention { failed: u64, pending: u64 },
}

impl SyncHealth {
    pub fn from_counts(pending: u64, failed: u64) -> Self {
        match (pending, failed) {
            (0, 0) => SyncHealth::Synced,
            (pending, 0) => SyncHealth::Pending { pending },
            (pending, failed) => SyncHealth::NeedsAttention { failed, pending },
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SyncHealth::Synced => "synced",
            SyncHealth::Pending { .. } => "pending",
            SyncHealth::NeedsAttention { .. } => "needs attention",
        }
    }
}

impl fmt::Display for SyncHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncHealth::Synced => write!(f, "all changes synced"),
            SyncHealth::Pending { pending } => write!(f, "{} change(s) pending", pending),
            SyncHealth::NeedsAttention { failed, pending } => write!(
                f,
                "sync failed for {} change(s), {} pending",
                failed, pending
            ),
        }
    }
}

/// Why a drain or pull did nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncSkip {
    AlreadyDraining,
    /// Offline, or no remote backend configured
    Offline,
}

/// Outcome of replaying one outbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReplayResult {
    /// Reflected remotely; entry removed
    Applied,
    /// Transient failure; retried on the next drain
    Retried { retry_count: u32, error: String },
    /// Quarantined
    Failed { error: String },
    /// An earlier entry for the same record did not apply in this pass
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayOutcome {
    pub mutation_id: String,
    pub action: MutationAction,
    pub container: Container,
    pub record_id: String,
    #[serde(flatten)]
    pub result: ReplayResult,
}

/// Summary of one drain pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SyncSkip>,
    pub outcomes: Vec<ReplayOutcome>,
    /// The outbox itself could not be read
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DrainReport {
    fn skipped(reason: SyncSkip) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    fn count(&self, pred: impl Fn(&ReplayResult) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(&o.result)).count()
    }

    pub fn applied(&self) -> usize {
        self.count(|r| matches!(r, ReplayResult::Applied))
    }

    pub fn retried(&self) -> usize {
        self.count(|r| matches!(r, ReplayResult::Retried { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|r| matches!(r, ReplayResult::Failed { .. }))
    }

    pub fn deferred(&self) -> usize {
        self.count(|r| matches!(r, ReplayResult::Deferred))
    }
}

/// Pull result for one container
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerPull {
    pub container: Container,
    /// Records returned by the remote
    pub fetched: usize,
    /// Records written to the local store
    pub applied: usize,
    /// Records kept local because they have unsent changes
    pub protected: usize,
    /// Records returned for a different owner
    pub ignored: usize,
    pub failures: Vec<BulkPutFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ContainerPull {
    fn new(container: Container) -> Self {
        Self {
            container,
            fetched: 0,
            applied: 0,
            protected: 0,
            ignored: 0,
            failures: Vec::new(),
            error: None,
        }
    }
}

/// Summary of a full pull
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PullReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<SyncSkip>,
    pub containers: Vec<ContainerPull>,
}

impl PullReport {
    pub fn applied(&self) -> usize {
        self.containers.iter().map(|c| c.applied).sum()
    }

    pub fn protected(&self) -> usize {
        self.containers.iter().map(|c| c.protected).sum()
    }

    pub fn errors(&self) -> usize {
        self.containers
            .iter()
            .filter(|c| c.error.is_some() || !c.failures.is_empty())
            .count()
    }

    pub fn container(&self, container: Container) -> Option<&ContainerPull> {
        self.containers.iter().find(|c| c.container == container)
    }
}

/// Drain followed by pull
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
    pub drain: DrainReport,
    pub pull: PullReport,
}

/// How a failed remote call is treated during replay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    /// The remote already reflects the mutation
    Applied,
    Retry,
    Quarantine,
}

fn disposition(action: MutationAction, error: &RemoteError) -> Disposition {
    match (action, error) {
        (MutationAction::Delete, RemoteError::NotFound) => Disposition::Applied,
        // The id is client-assigned; a conflict means an earlier attempt landed
        (MutationAction::Create, RemoteError::Conflict) => Disposition::Applied,
        (_, RemoteError::NotFound) => Disposition::Retry,
        (_, e) if e.is_transient() => Disposition::Retry,
        _ => Disposition::Quarantine,
    }
}

async fn apply_mutation(
    remote: &dyn RemoteBackend,
    action: MutationAction,
    container: Container,
    record: &Record,
) -> RemoteResult<()> {
    match action {
        MutationAction::Create => remote.insert(container, record).await,
        MutationAction::Update => remote.upsert(container, record).await,
        MutationAction::Delete => {
            remote
                .delete_where(container, &record.id, &record.owner_id)
                .await
        }
    }
}

/// A façade write waiting for the write-through worker
#[derive(Debug)]
struct WriteJob {
    path: WritePath,
    action: MutationAction,
    container: Container,
    record: Record,
}

/// Commands sent to the auto-sync task
#[derive(Debug)]
enum AutoSyncCommand {
    Shutdown,
}

struct AutoSync {
    command_tx: mpsc::Sender<AutoSyncCommand>,
    task: JoinHandle<()>,
}

impl AutoSync {
    /// The current drain, if any, runs to completion
    fn stop(self) {
        let _ = self.command_tx.try_send(AutoSyncCommand::Shutdown);
    }
}

/// Records changed while a pull of `container` was fetching
struct PullWatch {
    id: u64,
    container: Container,
    touched: HashSet<String>,
}

/// Registered for the whole of one container pull; unregisters on drop
struct PullWatchGuard<'a> {
    shared: &'a Shared,
    id: u64,
}

impl PullWatchGuard<'_> {
    fn touched(&self) -> HashSet<String> {
        self.shared
            .lock_pull_watches()
            .iter()
            .find(|w| w.id == self.id)
            .map(|w| w.touched.clone())
            .unwrap_or_default()
    }
}

impl Drop for PullWatchGuard<'_> {
    fn drop(&mut self) {
        self.shared.lock_pull_watches().retain(|w| w.id != self.id);
    }
}

/// Held by a façade write from its local change through the hand-off
pub(crate) struct WriteGuard<'a> {
    _order: AsyncMutexGuard<'a, ()>,
    _gate: RwLockReadGuard<'a, ()>,
}

struct Shared {
    local: LocalStore,
    outbox: Outbox,
    remote: Option<Arc<dyn RemoteBackend>>,
    connectivity: Connectivity,
    settings: SyncSettings,
    drain_state: AtomicU8,
    health: watch::Sender<SyncHealth>,
    /// Façade writes hold it shared; pull holds it exclusively while it
    /// decides which records to protect and applies the rest
    apply_gate: RwLock<()>,
    /// Serializes façade writes so hand-off order matches local write order
    write_order: AsyncMutex<()>,
    pull_watches: Mutex<Vec<PullWatch>>,
    next_watch: AtomicU64,
    jobs: mpsc::UnboundedSender<WriteJob>,
    /// Write-through jobs submitted and not yet resolved
    queued: watch::Sender<usize>,
    in_flight: Mutex<HashMap<(Container, String), usize>>,
    auto_sync: Mutex<Option<AutoSync>>,
}

impl Shared {
    fn lock_pull_watches(&self) -> MutexGuard<'_, Vec<PullWatch>> {
        self.pull_watches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tell running pulls of `container` that `id` changed under them
    fn note_touched(&self, container: Container, id: &str) {
        for watch in self
            .lock_pull_watches()
            .iter_mut()
            .filter(|w| w.container == container)
        {
            watch.touched.insert(id.to_string());
        }
    }

    fn watch_pull(&self, container: Container) -> PullWatchGuard<'_> {
        let id = self.next_watch.fetch_add(1, Ordering::Relaxed);
        self.lock_pull_watches().push(PullWatch {
            id,
            container,
            touched: HashSet::new(),
        });
        PullWatchGuard { shared: self, id }
    }
}

/// Handle to the sync manager; cheap to clone
#[derive(Clone)]
pub struct SyncManager {
    shared: Arc<Shared>,
}

impl SyncManager {
    /// Create a manager and start its write-through worker
    ///
    /// Must be called from within a Tokio runtime. With no remote backend
    /// every write is buffered and drain/pull do nothing.
    pub fn new(
        local: LocalStore,
        remote: Option<Arc<dyn RemoteBackend>>,
        connectivity: Connectivity,
        settings: SyncSettings,
    ) -> Self {
        let (jobs, jobs_rx) = mpsc::unbounded_channel();
        let (health, _) = watch::channel(SyncHealth::Synced);
        let (queued, _) = watch::channel(0usize);

        let shared = Arc::new(Shared {
            outbox: Outbox::new(local.clone()),
            local,
            remote,
            connectivity,
            settings,
            drain_state: AtomicU8::new(DrainState::Idle as u8),
            health,
            apply_gate: RwLock::new(()),
            write_order: AsyncMutex::new(()),
            pull_watches: Mutex::new(Vec::new()),
            next_watch: AtomicU64::new(0),
            jobs,
            queued,
            in_flight: Mutex::new(HashMap::new()),
            auto_sync: Mutex::new(None),
        });

        tokio::spawn(write_worker_task(Arc::downgrade(&shared), jobs_rx));

        Self { shared }
    }

    pub fn local(&self) -> &LocalStore {
        &self.shared.local
    }

    pub fn outbox(&self) -> &Outbox {
        &self.shared.outbox
    }

    pub fn settings(&self) -> SyncSettings {
        self.shared.settings
    }

    pub fn has_remote(&self) -> bool {
        self.shared.remote.is_some()
    }

    // ==================== Connectivity ====================

    /// Feed the platform's network signal
    ///
    /// Going from offline to online runs one drain and returns its report.
    /// Going offline only flips the flag.
    pub async fn set_connectivity(&self, online: bool) -> Option<DrainReport> {
        let was_online = self.shared.connectivity.set_online(online);
        if online && !was_online {
            Some(self.drain().await)
        } else {
            None
        }
    }

    pub fn is_online(&self) -> bool {
        self.shared.connectivity.is_online()
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.shared.connectivity
    }

    /// Register a callback for online/offline transitions
    pub fn on_connectivity_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.shared.connectivity.on_change(callback)
    }

    /// Online and a remote backend is configured
    pub fn is_remote_reachable(&self) -> bool {
        self.reachable_remote().is_some()
    }

    fn reachable_remote(&self) -> Option<Arc<dyn RemoteBackend>> {
        if !self.shared.connectivity.is_online() {
            return None;
        }
        self.shared.remote.clone()
    }

    // ==================== Health ====================

    pub fn health(&self) -> SyncHealth {
        *self.shared.health.borrow()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<SyncHealth> {
        self.shared.health.subscribe()
    }

    /// Recompute health from the outbox and queued write-throughs
    pub async fn refresh_health(&self) -> SyncHealth {
        let stats = match self.shared.outbox.stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Could not read outbox stats: {}", e);
                return self.health();
            }
        };
        let queued = *self.shared.queued.borrow() as u64;
        let health = SyncHealth::from_counts(stats.pending + queued, stats.failed);
        self.shared.health.send_if_modified(|current| {
            if *current == health {
                return false;
            }
            *current = health;
            true
        });
        health
    }

    pub fn drain_state(&self) -> DrainState {
        match self.shared.drain_state.load(Ordering::Acquire) {
            0 => DrainState::Idle,
            _ => DrainState::Draining,
        }
    }

    // ==================== Drain ====================

    /// Replay pending outbox entries against the remote, oldest first
    ///
    /// Never fails: every entry's outcome is recorded in the outbox and
    /// returned in the report. A transient failure is retried on the next
    /// drain, not in this one. Once an entry for a record fails, later
    /// entries for the same record wait for the next drain too.
    pub async fn drain(&self) -> DrainReport {
        let Some(_guard) = DrainGuard::acquire(&self.shared.drain_state) else {
            debug!("Drain already in progress, skipping");
            return DrainReport::skipped(SyncSkip::AlreadyDraining);
        };
        let Some(remote) = self.reachable_remote() else {
            debug!("Remote unreachable, not draining");
            return DrainReport::skipped(SyncSkip::Offline);
        };

        let pending = match self.shared.outbox.list_pending().await {
            Ok(pending) => pending,
            Err(e) => {
                error!("Failed to read outbox: {}", e);
                return DrainReport {
                    error: Some(e.to_string()),
                    ..Default::default()
                };
            }
        };

        let mut report = DrainReport::default();
        if !pending.is_empty() {
            info!("Draining {} queued change(s)", pending.len());
        }

        let mut blocked: HashSet<(Container, String)> = HashSet::new();
        for mutation in pending {
            let key = (mutation.container, mutation.record_id().to_string());
            let result = if blocked.contains(&key) {
                debug!(
                    "Deferring {} {}/{}: earlier change not yet applied",
                    mutation.action,
                    mutation.container,
                    mutation.record_id()
                );
                ReplayResult::Deferred
            } else {
                self.replay(remote.as_ref(), &mutation).await
            };

            if result == ReplayResult::Applied {
                self.shared.note_touched(mutation.container, mutation.record_id());
            } else {
                blocked.insert(key);
            }
            report.outcomes.push(ReplayOutcome {
                mutation_id: mutation.id.clone(),
                action: mutation.action,
                container: mutation.container,
                record_id: mutation.record_id().to_string(),
                result,
            });
        }

        if !report.outcomes.is_empty() {
            info!(
                "Drain complete: {} applied, {} retried, {} failed, {} deferred",
                report.applied(),
                report.retried(),
                report.failed(),
                report.deferred()
            );
        }
        self.refresh_health().await;
        report
    }

    async fn replay(&self, remote: &dyn RemoteBackend, mutation: &MutationRecord) -> ReplayResult {
        let outbox = &self.shared.outbox;
        let error = match apply_mutation(
            remote,
            mutation.action,
            mutation.container,
            &mutation.payload,
        )
        .await
        {
            Ok(()) => None,
            Err(e) => Some(e),
        };

        let disposition = match &error {
            None => Disposition::Applied,
            Some(e) => disposition(mutation.action, e),
        };

        match (disposition, error) {
            (Disposition::Applied, error) => {
                match error {
                    Some(e) => debug!(
                        "{} {}/{} already reflected remotely ({})",
                        mutation.action,
                        mutation.container,
                        mutation.record_id(),
                        e
                    ),
                    None => debug!(
                        "Replayed {} {}/{}",
                        mutation.action,
                        mutation.container,
                        mutation.record_id()
                    ),
                }
                if let Err(e) = outbox.mark_completed(&mutation.id).await {
                    error!("Failed to complete outbox entry {}: {}", mutation.id, e);
                }
                ReplayResult::Applied
            }
            (Disposition::Retry, Some(e)) => {
                let message = e.to_string();
                let retry_count = match outbox.increment_retry(&mutation.id, &message).await {
                    Ok(count) => count,
                    Err(storage) => {
                        error!("Failed to record retry for {}: {}", mutation.id, storage);
                        mutation.retry_count + 1
                    }
                };

                if retry_count >= self.shared.settings.max_retries {
                    error!(
                        "Giving up on {} {}/{} after {} attempts: {}",
                        mutation.action,
                        mutation.container,
                        mutation.record_id(),
                        retry_count,
                        message
                    );
                    self.quarantine(mutation, &message).await;
                    ReplayResult::Failed { error: message }
                } else {
                    warn!(
                        "Transient failure replaying {} {}/{} (attempt {}): {}",
                        mutation.action,
                        mutation.container,
                        mutation.record_id(),
                        retry_count,
                        message
                    );
                    ReplayResult::Retried {
                        retry_count,
                        error: message,
                    }
                }
            }
            (_, error) => {
                let message = error.map(|e| e.to_string()).unwrap_or_default();
                error!(
                    "Remote rejected {} {}/{}: {}",
                    mutation.action,
                    mutation.container,
                    mutation.record_id(),
                    message
                );
                self.quarantine(mutation, &message).await;
                ReplayResult::Failed { error: message }
            }
        }
    }

    async fn quarantine(&self, mutation: &MutationRecord, reason: &str) {
        if let Err(e) = self.shared.outbox.mark_failed(&mutation.id, reason).await {
            error!("Failed to quarantine outbox entry {}: {}", mutation.id, e);
        }
    }

    // ==================== Pull ====================

    /// Refresh every container for `owner_id` from the remote
    ///
    /// Remote data overwrites local data, except for records with unsent
    /// local changes. Local records missing remotely are kept.
    pub async fn pull_all(&self, owner_id: &str) -> PullReport {
        let Some(remote) = self.reachable_remote() else {
            debug!("Remote unreachable, not pulling");
            return PullReport {
                skipped: Some(SyncSkip::Offline),
                ..Default::default()
            };
        };

        info!("Pulling all containers for {}", owner_id);
        let mut report = PullReport::default();
        for container in Container::ALL {
            let pulled = self.pull_container(remote.as_ref(), container, owner_id).await;
            report.containers.push(pulled);
        }

        info!(
            "Pull complete: {} applied, {} kept local, {} container(s) with errors",
            report.applied(),
            report.protected(),
            report.errors()
        );
        self.refresh_health().await;
        report
    }

    /// Refresh one container; `None` if the remote is unreachable
    pub async fn refresh_container(
        &self,
        container: Container,
        owner_id: &str,
    ) -> Option<ContainerPull> {
        let remote = self.reachable_remote()?;
        Some(self.pull_container(remote.as_ref(), container, owner_id).await)
    }

    async fn pull_container(
        &self,
        remote: &dyn RemoteBackend,
        container: Container,
        owner_id: &str,
    ) -> ContainerPull {
        let mut result = ContainerPull::new(container);

        // Anything pending now, or changed while the snapshot is in transit,
        // may be newer locally than what the remote returns
        let watch = self.shared.watch_pull(container);
        let mut protected = match self.protected_ids(container).await {
            Ok(ids) => ids,
            Err(e) => {
                error!("Failed to read outbox before pull of {}: {}", container, e);
                result.error = Some(e.to_string());
                return result;
            }
        };

        let fetched = match remote.select_all(container, owner_id).await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to fetch {} from remote: {}", container, e);
                result.error = Some(e.to_string());
                return result;
            }
        };
        result.fetched = fetched.len();

        let _gate = self.shared.apply_gate.write().await;

        match self.protected_ids(container).await {
            Ok(ids) => protected.extend(ids),
            Err(e) => {
                error!("Failed to read outbox during pull of {}: {}", container, e);
                result.error = Some(e.to_string());
                return result;
            }
        }
        protected.extend(watch.touched());

        let mut records = Vec::with_capacity(fetched.len());
        for record in fetched {
            if record.owner_id != owner_id {
                warn!(
                    "Ignoring {}/{} returned for another owner",
                    container, record.id
                );
                result.ignored += 1;
            } else if protected.contains(&record.id) {
                debug!(
                    "Keeping local {}/{}: unsent changes",
                    container, record.id
                );
                result.protected += 1;
            } else {
                records.push(record);
            }
        }

        match self.shared.local.bulk_put(container, records).await {
            Ok(applied) => {
                for failure in &applied.failures {
                    warn!(
                        "Could not store pulled {}/{}: {}",
                        container, failure.id, failure.error
                    );
                }
                result.applied = applied.applied;
                result.failures = applied.failures;
            }
            Err(e) => {
                error!("Failed to apply pulled {}: {}", container, e);
                result.error = Some(e.to_string());
            }
        }
        result
    }

    /// Records with pending outbox entries or write-throughs in flight
    async fn protected_ids(&self, container: Container) -> StorageResult<HashSet<String>> {
        let mut ids = self.shared.outbox.pending_record_ids(container).await?;
        ids.extend(self.in_flight_ids(container));
        Ok(ids)
    }

    /// Drain, then pull
    pub async fn sync_all(&self, owner_id: &str) -> SyncReport {
        let drain = self.drain().await;
        let pull = self.pull_all(owner_id).await;
        SyncReport { drain, pull }
    }

    /// Wipe every container and the outbox
    pub async fn clear_local_data(&self) -> StorageResult<()> {
        info!("Clearing local data");
        self.shared.local.clear_all().await?;
        self.refresh_health().await;
        Ok(())
    }

    // ==================== Operator actions ====================

    /// Put a failed entry back in the queue
    pub async fn requeue(&self, mutation_id: &str) -> StorageResult<bool> {
        let requeued = self.shared.outbox.requeue(mutation_id).await?;
        if requeued {
            info!("Requeued outbox entry {}", mutation_id);
            self.refresh_health().await;
        }
        Ok(requeued)
    }

    /// Drop a failed entry for good
    pub async fn discard(&self, mutation_id: &str) -> StorageResult<bool> {
        let discarded = self.shared.outbox.discard(mutation_id).await?;
        if discarded {
            info!("Discarded outbox entry {}", mutation_id);
            self.refresh_health().await;
        }
        Ok(discarded)
    }

    // ==================== Auto-sync ====================

    /// Drain every `interval` until stopped
    ///
    /// Replaces a timer that is already running.
    pub fn start_auto_sync(&self, interval: Duration) {
        let interval = interval.max(Duration::from_millis(1));
        let (command_tx, command_rx) = mpsc::channel(1);
        let task = tokio::spawn(auto_sync_task(
            Arc::downgrade(&self.shared),
            interval,
            command_rx,
        ));

        let previous = self
            .lock_auto_sync()
            .replace(AutoSync { command_tx, task });
        if let Some(previous) = previous {
            previous.stop();
            debug!("Replaced running auto-sync timer");
        }
        info!("Auto-sync started (every {:?})", interval);
    }

    /// Stop the timer; a drain already in progress runs to completion
    pub fn stop_auto_sync(&self) -> bool {
        match self.lock_auto_sync().take() {
            Some(auto_sync) => {
                auto_sync.stop();
                info!("Auto-sync stopped");
                true
            }
            None => false,
        }
    }

    pub fn is_auto_sync_running(&self) -> bool {
        self.lock_auto_sync()
            .as_ref()
            .is_some_and(|auto_sync| !auto_sync.task.is_finished())
    }

    fn lock_auto_sync(&self) -> MutexGuard<'_, Option<AutoSync>> {
        self.shared
            .auto_sync
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ==================== Write-through ====================

    /// Taken by façade writes: one at a time, and never during a pull's apply
    pub(crate) async fn write_gate(&self) -> WriteGuard<'_> {
        let order = self.shared.write_order.lock().await;
        let gate = self.shared.apply_gate.read().await;
        WriteGuard {
            _order: order,
            _gate: gate,
        }
    }

    /// Hand a local write to the remote side
    ///
    /// Buffered writes go straight to the outbox when no write-through is
    /// queued; otherwise they queue behind the worker to keep order. The
    /// caller holds [`write_gate`](Self::write_gate), so no other write can
    /// be submitted between the idle check and the enqueue.
    pub(crate) async fn submit(
        &self,
        path: WritePath,
        action: MutationAction,
        container: Container,
        record: Record,
    ) -> StorageResult<()> {
        self.shared.note_touched(container, &record.id);

        let worker_idle = *self.shared.queued.borrow() == 0;
        if path == WritePath::Buffered && worker_idle {
            self.shared.outbox.enqueue(action, container, record).await?;
            self.refresh_health().await;
            return Ok(());
        }

        self.track(container, &record.id);
        let job = WriteJob {
            path,
            action,
            container,
            record,
        };
        if let Err(mpsc::error::SendError(job)) = self.shared.jobs.send(job) {
            warn!("Write-through worker stopped; buffering");
            self.release(job.container, &job.record.id);
            self.shared
                .outbox
                .enqueue(job.action, job.container, job.record)
                .await?;
        }
        self.refresh_health().await;
        Ok(())
    }

    /// Wait until every submitted write-through has been resolved
    pub async fn flush(&self) {
        let mut queued = self.shared.queued.subscribe();
        // The sender lives in `shared`, so this only ends at zero
        let _ = queued.wait_for(|n| *n == 0).await;
        self.refresh_health().await;
    }

    async fn write_through(&self, job: WriteJob) {
        let WriteJob {
            path,
            action,
            container,
            record,
        } = job;

        let remote = match path {
            WritePath::Immediate => self.reachable_remote(),
            WritePath::Buffered => None,
        };
        let outcome: Result<(), String> = match remote {
            None => Err("offline".to_string()),
            Some(remote) => match self.shared.outbox.has_pending(container, &record.id).await {
                Ok(true) => Err("earlier changes are still queued".to_string()),
                Ok(false) => match apply_mutation(remote.as_ref(), action, container, &record).await
                {
                    Ok(()) => Ok(()),
                    Err(e) if disposition(action, &e) == Disposition::Applied => Ok(()),
                    Err(e) => Err(e.to_string()),
                },
                Err(e) => Err(e.to_string()),
            },
        };

        match outcome {
            Ok(()) => debug!("Wrote {} {}/{} through", action, container, record.id),
            Err(reason) => {
                debug!(
                    "Buffering {} {}/{}: {}",
                    action, container, record.id, reason
                );
                if let Err(e) = self
                    .shared
                    .outbox
                    .enqueue(action, container, record.clone())
                    .await
                {
                    error!(
                        "Failed to queue {} {}/{}; change is local only: {}",
                        action, container, record.id, e
                    );
                }
            }
        }

        self.shared.note_touched(container, &record.id);
        self.release(container, &record.id);
        self.refresh_health().await;
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<(Container, String), usize>> {
        self.shared
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, container: Container, id: &str) {
        *self
            .lock_in_flight()
            .entry((container, id.to_string()))
            .or_insert(0) += 1;
        self.shared.queued.send_modify(|n| *n += 1);
    }

    fn release(&self, container: Container, id: &str) {
        {
            let mut in_flight = self.lock_in_flight();
            let key = (container, id.to_string());
            if let Some(count) = in_flight.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    in_flight.remove(&key);
                }
            }
        }
        self.shared.queued.send_modify(|n| *n = n.saturating_sub(1));
    }

    fn in_flight_ids(&self, container: Container) -> Vec<String> {
        self.lock_in_flight()
            .keys()
            .filter(|(c, _)| *c == container)
            .map(|(_, id)| id.clone())
            .collect()
    }
}

/// Resolves write-through jobs one at a time, in submission order
async fn write_worker_task(shared: Weak<Shared>, mut jobs_rx: mpsc::UnboundedReceiver<WriteJob>) {
    while let Some(job) = jobs_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        SyncManager { shared }.write_through(job).await;
    }
    debug!("Write-through worker stopped");
}

/// Background task that drains on a fixed period
async fn auto_sync_task(
    shared: Weak<Shared>,
    interval: Duration,
    mut command_rx: mpsc::Receiver<AutoSyncCommand>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                let Some(manager) = shared.upgrade().map(|shared| SyncManager { shared }) else {
                    break;
                };
                manager.drain().await;
            }
            cmd = command_rx.recv() => {
                if matches!(cmd, Some(AutoSyncCommand::Shutdown) | None) {
                    break;
                }
            }
        }
    }
    debug!("Auto-sync task exited");
}
