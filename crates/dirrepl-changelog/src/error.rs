//! Error types for the replication changelog.

use dirrepl_store::StoreError;
use thiserror::Error;

use crate::csn::Csn;

/// Errors that can occur in the changelog subsystem.
///
/// `OrderingViolation`, `MisroutedRecord` and `IllegalState` report broken
/// caller contracts. They are never corrected silently and callers must treat
/// them as fatal for the component that raised them.
#[derive(Debug, Error)]
pub enum ChangelogError {
    /// A record was appended with a CSN not strictly greater than the newest one.
    #[error("out of order append to {domain_dn}/{replica_id}: {attempted} is not after {newest}")]
    OrderingViolation {
        /// Domain of the log.
        domain_dn: String,
        /// Replica owning the log.
        replica_id: i16,
        /// Newest CSN already in the log.
        newest: Csn,
        /// CSN that was rejected.
        attempted: Csn,
    },

    /// A record was handed to a log that does not own its domain or replica.
    #[error(
        "record {csn} for domain '{record_domain}' does not belong to log {domain_dn}/{replica_id}"
    )]
    MisroutedRecord {
        /// Domain of the log.
        domain_dn: String,
        /// Replica owning the log.
        replica_id: i16,
        /// Domain carried by the record.
        record_domain: String,
        /// CSN carried by the record.
        csn: Csn,
    },

    /// Lifecycle misuse: double initialization, removal with open cursors, use before init.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// The log was closed by a shutdown.
    #[error("log {0} is closed")]
    Closed(String),

    /// Storage I/O failure or corruption.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// A stored key or value does not decode.
    #[error("corrupted log record: {0}")]
    Corrupted(String),

    /// A CSN could not be decoded.
    #[error("invalid CSN: {0}")]
    InvalidCsn(String),

    /// A server state could not be decoded.
    #[error("invalid server state: {0}")]
    InvalidServerState(String),

    /// Session transport failure.
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by a replication [`Session`](crate::session::Session).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The peer went away.
    #[error("session closed")]
    Closed,

    /// Underlying I/O failure.
    #[error("session I/O error: {0}")]
    Io(String),
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),

    /// The file extension is neither `.toml` nor `.json`.
    #[error("unsupported config file extension: '{0}'")]
    UnsupportedFormat(String),

    /// The file content does not parse.
    #[error("cannot parse config: {0}")]
    Parse(String),

    /// A value is outside its allowed range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Result alias for changelog operations.
pub type Result<T> = std::result::Result<T, ChangelogError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering_violation_display() {
        let err = ChangelogError::OrderingViolation {
            domain_dn: "o=test".to_string(),
            replica_id: 1,
            newest: Csn::new(2000, 0, 1),
            attempted: Csn::new(1000, 0, 1),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("out of order append to o=test/1"));
        assert!(msg.contains(&Csn::new(1000, 0, 1).to_string()));
    }

    #[test]
    fn test_store_error_converts() {
        let err: ChangelogError = StoreError::Internal("boom".to_string()).into();
        assert!(matches!(err, ChangelogError::Storage(_)));
    }

    #[test]
    fn test_transport_error_converts() {
        let err: ChangelogError = TransportError::Closed.into();
        assert_eq!(err.to_string(), "transport failure: session closed");
    }
}
