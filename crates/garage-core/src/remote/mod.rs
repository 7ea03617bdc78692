//! Remote backend
//!
//! The per-container CRUD surface the sync manager replays against. Every
//! call is scoped by owner and returns a `RemoteError` classified as
//! transient (worth retrying later) or permanent.
//!
//! ## Implementations
//!
//! - [`http::HttpBackend`]: PostgREST-style HTTPS API
//! - [`memory::MemoryBackend`]: in-process tables with fault injection

pub mod http;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Container, Record};

pub use http::HttpBackend;
pub use memory::MemoryBackend;

/// Errors reported by a remote backend
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Could not reach the backend
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    /// 5xx, 408 or 429
    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The targeted record does not exist remotely
    #[error("Record not found on remote")]
    NotFound,

    /// A record with this id already exists remotely
    #[error("Record already exists on remote")]
    Conflict,

    /// The backend refused the request; retrying cannot help
    #[error("Rejected by remote ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// The response body could not be decoded
    #[error("Invalid response from remote: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => RemoteError::NotFound,
            409 => RemoteError::Conflict,
            408 | 429 | 500..=599 => RemoteError::Server { status, message },
            _ => RemoteError::Rejected { status, message },
        }
    }

    /// Whether a later attempt could succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::Server { .. }
        )
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            RemoteError::Timeout
        } else if error.is_decode() {
            RemoteError::InvalidResponse(error.to_string())
        } else if let Some(status) = error.status() {
            RemoteError::from_status(status.as_u16(), error.to_string())
        } else {
            RemoteError::Network(error.to_string())
        }
    }
}

/// Result type for remote operations
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Per-container CRUD surface of the remote store
///
/// The conflict key for `upsert` is always the record `id`.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert a new record; `Conflict` if the id is taken
    async fn insert(&self, container: Container, record: &Record) -> RemoteResult<()>;

    /// Insert or replace by id
    async fn upsert(&self, container: Container, record: &Record) -> RemoteResult<()>;

    /// Delete the record matching both id and owner; `NotFound` if none did
    async fn delete_where(&self, container: Container, id: &str, owner_id: &str)
        -> RemoteResult<()>;

    /// Every record in `container` owned by `owner_id`
    async fn select_all(&self, container: Container, owner_id: &str) -> RemoteResult<Vec<Record>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(RemoteError::from_status(404, ""), RemoteError::NotFound);
        assert_eq!(RemoteError::from_status(409, ""), RemoteError::Conflict);
        assert!(RemoteError::from_status(500, "boom").is_transient());
        assert!(RemoteError::from_status(503, "").is_transient());
        assert!(RemoteError::from_status(408, "").is_transient());
        assert!(RemoteError::from_status(429, "").is_transient());
        assert!(!RemoteError::from_status(400, "bad").is_transient());
        assert!(!RemoteError::from_status(422, "").is_transient());
        assert!(matches!(
            RemoteError::from_status(401, "no key"),
            RemoteError::Rejected { status: 401, .. }
        ));
    }

    #[test]
    fn test_transport_errors_are_transient() {
        assert!(RemoteError::Network("refused".into()).is_transient());
        assert!(RemoteError::Timeout.is_transient());
        assert!(!RemoteError::NotFound.is_transient());
        assert!(!RemoteError::Conflict.is_transient());
        assert!(!RemoteError::InvalidResponse("eof".into()).is_transient());
    }
}
