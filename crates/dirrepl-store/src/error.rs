//! Error types for the ordered store.

use thiserror::Error;

/// Errors raised by a [`KvStore`](crate::KvStore) or [`StoreProvider`](crate::StoreProvider).
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying file system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A lock guarding in-memory state was poisoned, or another internal failure occurred.
    #[error("store error: {0}")]
    Internal(String),

    /// Persisted data could not be decoded.
    #[error("store {path} is corrupted: {msg}")]
    Corrupted {
        /// Location of the damaged file.
        path: String,
        /// What failed to decode.
        msg: String,
    },

    /// The store name does not map to a valid location.
    #[error("invalid store name '{0}'")]
    InvalidName(String),
}

impl StoreError {
    pub(crate) fn poisoned<E: std::fmt::Display>(e: E) -> Self {
        StoreError::Internal(e.to_string())
    }
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corrupted_display() {
        let err = StoreError::Corrupted {
            path: "/tmp/x/wal.bin".to_string(),
            msg: "truncated record".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "store /tmp/x/wal.bin is corrupted: truncated record"
        );
    }

    #[test]
    fn test_io_from() {
        let err: StoreError = std::io::Error::other("disk gone").into();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
