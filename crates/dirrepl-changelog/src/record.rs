//! Log records and their storage codecs.
//!
//! Records are plain values. How they map to store keys and values lives in the
//! [`RecordCodec`] implementations next to them.

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::csn::Csn;
use crate::error::{ChangelogError, Result};

/// Replicated operation carried by a change record. Payloads are opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Entry creation.
    Add {
        /// DN of the new entry.
        dn: String,
        /// Encoded entry.
        entry: Vec<u8>,
    },
    /// Entry removal.
    Delete {
        /// DN of the removed entry.
        dn: String,
    },
    /// Attribute modifications.
    Modify {
        /// DN of the modified entry.
        dn: String,
        /// Encoded modifications.
        changes: Vec<u8>,
    },
    /// Entry rename or move.
    ModifyDn {
        /// Current DN of the entry.
        dn: String,
        /// New relative DN.
        new_rdn: String,
        /// New parent, when the entry moves.
        new_superior: Option<String>,
        /// Whether the old RDN values are removed.
        delete_old_rdn: bool,
    },
}

impl Operation {
    /// DN of the entry the operation targets.
    pub fn dn(&self) -> &str {
        match self {
            Operation::Add { dn, .. }
            | Operation::Delete { dn }
            | Operation::Modify { dn, .. }
            | Operation::ModifyDn { dn, .. } => dn,
        }
    }
}

/// One replicated change, as stored in a replica log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    /// Identity and position of the change.
    pub csn: Csn,
    /// Replication domain the change belongs to.
    pub domain_dn: String,
    /// The change itself.
    pub operation: Operation,
}

impl ChangeRecord {
    /// Creates a record.
    pub fn new(csn: Csn, domain_dn: impl Into<String>, operation: Operation) -> Self {
        Self {
            csn,
            domain_dn: domain_dn.into(),
            operation,
        }
    }
}

/// One entry of the change number index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRecord {
    /// External, strictly increasing change number.
    pub change_number: i64,
    /// Domain of the indexed change.
    pub domain_dn: String,
    /// CSN of the indexed change.
    pub csn: Csn,
}

/// Maps records of one log type to store keys and values.
pub trait RecordCodec: Send + Sync + 'static {
    /// Ordered key type.
    type Key: Ord + Copy + Debug + Send + Sync;
    /// Record type.
    type Record: Clone + Debug + Send + Sync;

    /// Key bytes; byte order must equal `Key` order.
    fn encode_key(key: &Self::Key) -> Vec<u8>;
    /// Inverse of `encode_key`.
    fn decode_key(bytes: &[u8]) -> Result<Self::Key>;
    /// Key of a record.
    fn key_of(record: &Self::Record) -> Self::Key;
    /// Value bytes of a record.
    fn encode_value(record: &Self::Record) -> Result<Vec<u8>>;
    /// Rebuilds a record from its key and value.
    fn decode_value(key: Self::Key, bytes: &[u8]) -> Result<Self::Record>;
}

#[derive(Serialize, Deserialize)]
struct StoredChange {
    domain_dn: String,
    operation: Operation,
}

/// Codec of replica logs: CSN keys, bincode values.
#[derive(Debug)]
pub struct ChangeRecordCodec;

impl RecordCodec for ChangeRecordCodec {
    type Key = Csn;
    type Record = ChangeRecord;

    fn encode_key(key: &Csn) -> Vec<u8> {
        key.to_key().to_vec()
    }

    fn decode_key(bytes: &[u8]) -> Result<Csn> {
        Csn::from_key(bytes)
    }

    fn key_of(record: &ChangeRecord) -> Csn {
        record.csn
    }

    fn encode_value(record: &ChangeRecord) -> Result<Vec<u8>> {
        let stored = StoredChange {
            domain_dn: record.domain_dn.clone(),
            operation: record.operation.clone(),
        };
        Ok(bincode::serialize(&stored)?)
    }

    fn decode_value(csn: Csn, bytes: &[u8]) -> Result<ChangeRecord> {
        let stored: StoredChange = bincode::deserialize(bytes)?;
        Ok(ChangeRecord {
            csn,
            domain_dn: stored.domain_dn,
            operation: stored.operation,
        })
    }
}

/// Codec of the change number index: sign-flipped big-endian `i64` keys.
#[derive(Debug)]
pub struct IndexRecordCodec;

/// 8-byte key of a change number.
pub fn change_number_key(change_number: i64) -> [u8; 8] {
    ((change_number as u64) ^ (1 << 63)).to_be_bytes()
}

impl RecordCodec for IndexRecordCodec {
    type Key = i64;
    type Record = IndexRecord;

    fn encode_key(key: &i64) -> Vec<u8> {
        change_number_key(*key).to_vec()
    }

    fn decode_key(bytes: &[u8]) -> Result<i64> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            ChangelogError::Corrupted(format!(
                "change number key must be 8 bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
    }

    fn key_of(record: &IndexRecord) -> i64 {
        record.change_number
    }

    fn encode_value(record: &IndexRecord) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&(record.domain_dn.as_str(), record.csn))?)
    }

    fn decode_value(change_number: i64, bytes: &[u8]) -> Result<IndexRecord> {
        let (domain_dn, csn): (String, Csn) = bincode::deserialize(bytes)?;
        Ok(IndexRecord {
            change_number,
            domain_dn,
            csn,
        })
    }
}
