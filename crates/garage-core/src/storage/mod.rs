//! Storage layer
//!
//! Handles the on-device SQLite database: entity containers and the
//! durable outbox of mutations waiting to reach the remote backend.
//!
//! ## Architecture
//!
//! - **LocalStore**: Source of truth on the device, one table per container
//! - **Outbox**: FIFO queue of create/update/delete mutations for replay
//!
//! Both share one connection, so a write and its outbox entry never race
//! each other in the database.

pub mod error;
pub mod local;
pub mod outbox;
pub mod schema;

pub use error::{StorageError, StorageResult, UnavailableReason};
pub use local::{BulkPutFailure, BulkPutReport, IndexKey, LocalStore};
pub use outbox::{Outbox, OutboxStats};
pub use schema::{init_schema, needs_init, OUTBOX_TABLE, SCHEMA_VERSION};
