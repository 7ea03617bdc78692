//! Garage Core Library
//!
//! This crate provides offline-first persistence and sync for a repair-shop
//! record keeper: customers, vendors, suppliers, labour, inventory, jobs,
//! ledger entries, settings and companies.
//!
//! # Architecture
//!
//! - **SQLite**: Source of truth on the device, one table per container
//! - **Outbox**: Durable FIFO queue of changes not yet confirmed remotely
//! - **Remote backend**: Hosted database, reconciled by full-snapshot pulls
//!
//! Reads and writes are always served locally; the network is only touched
//! in the background.
//!
//! # Quick Start
//!
//! ```text
//! let store = Store::open(&config).await?;
//!
//! // Create a customer (returns immediately, online or not)
//! let ravi = store.create(Container::Customers, data, "u1").await?;
//!
//! // Query customers
//! let customers = store.read(Container::Customers, "u1").await?;
//!
//! // Keep the outbox draining
//! store.sync().start_auto_sync(config.sync_settings().auto_sync_interval);
//! ```
//!
//! # Modules
//!
//! - `store`: Data façade (main entry point)
//! - `models`: Records, containers and queued mutations
//! - `storage`: Local SQLite store and outbox
//! - `remote`: Remote backend trait and clients
//! - `sync`: Drain, pull, connectivity and auto-sync
//! - `config`: Application configuration

pub mod config;
pub mod models;
pub mod remote;
pub mod storage;
pub mod store;
pub mod sync;

pub use config::Config;
pub use models::{Container, MutationAction, MutationRecord, MutationStatus, Record};
pub use remote::{HttpBackend, MemoryBackend, RemoteBackend, RemoteError};
pub use storage::{LocalStore, Outbox, OutboxStats, StorageError, StorageResult};
pub use store::{resolve_write_path, Store, WritePath};
pub use sync::{Connectivity, SyncHealth, SyncManager, SyncSettings};
