//! Synchronization with the remote backend
//!
//! The [`SyncManager`] owns everything that talks to the network: outbox
//! replay, full-snapshot pulls, the write-through worker and the auto-sync
//! timer. [`Connectivity`] is the injected online/offline state it reads.
//!
//! ## Usage
//!
//! ```ignore
//! let manager = SyncManager::new(local, Some(remote), Connectivity::new(true), settings);
//! manager.pull_all(owner_id).await;
//! manager.start_auto_sync(settings.auto_sync_interval);
//! ```

mod connectivity;
mod manager;

pub use connectivity::{Connectivity, ListenerId};
pub use manager::{
    ContainerPull, DrainReport, DrainState, PullReport, ReplayOutcome, ReplayResult, SyncHealth,
    SyncManager, SyncReport, SyncSettings, SyncSkip, DEFAULT_AUTO_SYNC_INTERVAL,
    DEFAULT_MAX_RETRIES,
};
