//! Storage error handling
//!
//! Provides typed errors for local store operations with descriptive
//! messages and recovery suggestions.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::models::Container;

/// Why the local store could not be opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
    /// The platform denied access to the data location
    PermissionDenied,
    /// Disk is full or a quota was exceeded
    QuotaExceeded,
    /// The database could not be opened or initialized
    OpenFailed,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            UnavailableReason::PermissionDenied => "permission denied",
            UnavailableReason::QuotaExceeded => "quota exceeded",
            UnavailableReason::OpenFailed => "open failed",
        };
        f.write_str(text)
    }
}

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    /// Local storage cannot be used at all; offline capability is lost
    #[error("Local storage unavailable at '{path}' ({reason}): {details}")]
    Unavailable {
        path: PathBuf,
        reason: UnavailableReason,
        details: String,
    },

    /// Insert-only write hit an existing id
    #[error("Record '{id}' already exists in '{container}'")]
    DuplicateKey { container: Container, id: String },

    /// Record expected to exist locally was not found
    #[error("Record '{id}' not found in '{container}'")]
    NotFound { container: Container, id: String },

    /// A stored row could not be decoded
    #[error("Stored row '{id}' in '{container}' is corrupted: {details}")]
    Corrupt {
        container: String,
        id: String,
        details: String,
    },

    /// SQLite database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// JSON encoding of record fields failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The blocking database task failed or its lock was poisoned
    #[error("Storage task failed: {0}")]
    Background(String),
}

impl StorageError {
    /// Create an `Unavailable` error from an I/O error with path context
    ///
    /// Classifies the error based on its kind (permission, disk full, etc.)
    pub fn from_io(error: io::Error, path: PathBuf) -> Self {
        let reason = match error.kind() {
            io::ErrorKind::PermissionDenied => UnavailableReason::PermissionDenied,
            _ if is_disk_full_error(&error) => UnavailableReason::QuotaExceeded,
            _ => UnavailableReason::OpenFailed,
        };
        StorageError::Unavailable {
            path,
            reason,
            details: error.to_string(),
        }
    }

    /// Create an `Unavailable` error from a failed SQLite open
    pub fn from_open(error: rusqlite::Error, path: PathBuf) -> Self {
        let reason = match error.sqlite_error_code() {
            Some(rusqlite::ErrorCode::PermissionDenied)
            | Some(rusqlite::ErrorCode::ReadOnly)
            | Some(rusqlite::ErrorCode::CannotOpen) => UnavailableReason::PermissionDenied,
            Some(rusqlite::ErrorCode::DiskFull) => UnavailableReason::QuotaExceeded,
            _ => UnavailableReason::OpenFailed,
        };
        StorageError::Unavailable {
            path,
            reason,
            details: error.to_string(),
        }
    }

    /// Whether this error means the store could not be opened at all
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable { .. })
    }

    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable {
                reason: UnavailableReason::PermissionDenied | UnavailableReason::QuotaExceeded,
                ..
            } | StorageError::NotFound { .. }
        )
    }

    /// Get a recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            StorageError::Unavailable {
                reason: UnavailableReason::QuotaExceeded,
                ..
            } => Some("Free up disk space and try again."),
            StorageError::Unavailable {
                reason: UnavailableReason::PermissionDenied,
                ..
            } => Some(
                "Check permissions on the data directory, or point data_dir somewhere writable.",
            ),
            StorageError::Unavailable { .. } => Some(
                "Changes are kept in memory for this session only. \
                 Check the data directory and restart.",
            ),
            StorageError::DuplicateKey { .. } => {
                Some("Use update for existing records, or omit the id to have one assigned.")
            }
            StorageError::Corrupt { .. } => {
                Some("Pull from the remote to overwrite the damaged copy, or delete the record.")
            }
            _ => None,
        }
    }
}

/// Check if an I/O error indicates disk full condition
fn is_disk_full_error(error: &io::Error) -> bool {
    let msg = error.to_string().to_lowercase();
    msg.contains("no space left")
        || msg.contains("disk full")
        || msg.contains("quota exceeded")
        || msg.contains("not enough space")
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_classification() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StorageError::from_io(io_err, PathBuf::from("/test/path"));

        assert!(matches!(
            err,
            StorageError::Unavailable {
                reason: UnavailableReason::PermissionDenied,
                ..
            }
        ));
        assert!(err.is_unavailable());
        assert!(err.is_recoverable());
        assert!(err.recovery_suggestion().is_some());
    }

    #[test]
    fn test_disk_full_detection() {
        let io_err = io::Error::new(io::ErrorKind::Other, "No space left on device");
        let err = StorageError::from_io(io_err, PathBuf::from("/full/disk"));

        assert!(matches!(
            err,
            StorageError::Unavailable {
                reason: UnavailableReason::QuotaExceeded,
                ..
            }
        ));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_other_io_is_open_failure() {
        let io_err = io::Error::new(io::ErrorKind::Other, "device not configured");
        let err = StorageError::from_io(io_err, PathBuf::from("/dev/null/db"));

        assert!(matches!(
            err,
            StorageError::Unavailable {
                reason: UnavailableReason::OpenFailed,
                ..
            }
        ));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = StorageError::Unavailable {
            path: PathBuf::from("/test/garage.db"),
            reason: UnavailableReason::PermissionDenied,
            details: "denied".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("unavailable"));
        assert!(msg.contains("/test/garage.db"));
        assert!(msg.contains("permission denied"));
    }

    #[test]
    fn test_duplicate_key_display() {
        let err = StorageError::DuplicateKey {
            container: Container::Customers,
            id: "c-1".to_string(),
        };

        let msg = err.to_string();
        assert!(msg.contains("c-1"));
        assert!(msg.contains("customers"));
        assert!(!err.is_unavailable());
    }
}
