//! Change sequence numbers.
//!
//! A [`Csn`] identifies one change made on one replica. CSNs are totally ordered by
//! `(timestamp, seqnum, replica_id)`, so comparing CSNs from different replicas gives
//! a consistent global order.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ChangelogError;

/// Length of the persisted key form.
pub const CSN_KEY_LEN: usize = 12;

/// Change sequence number.
///
/// Field order matters: the derived `Ord` compares timestamp first, then sequence
/// number, then replica id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Csn {
    timestamp: i64,
    seqnum: u16,
    replica_id: i16,
}

impl Csn {
    /// Creates a CSN.
    pub const fn new(timestamp: i64, seqnum: u16, replica_id: i16) -> Self {
        Self {
            timestamp,
            seqnum,
            replica_id,
        }
    }

    /// Milliseconds since the Unix epoch on the originating replica.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Disambiguates CSNs generated within the same millisecond.
    pub fn seqnum(&self) -> u16 {
        self.seqnum
    }

    /// Replica that generated this CSN.
    pub fn replica_id(&self) -> i16 {
        self.replica_id
    }

    /// True when this CSN was stamped more recently than `other`, ignoring the replica.
    pub fn is_newer_than(&self, other: &Csn) -> bool {
        (self.timestamp, self.seqnum) > (other.timestamp, other.seqnum)
    }

    /// 12-byte key whose byte order equals the CSN order.
    ///
    /// Big-endian fields with the sign bit flipped on the signed ones.
    pub fn to_key(&self) -> [u8; CSN_KEY_LEN] {
        let mut key = [0u8; CSN_KEY_LEN];
        key[..8].copy_from_slice(&((self.timestamp as u64) ^ (1 << 63)).to_be_bytes());
        key[8..10].copy_from_slice(&self.seqnum.to_be_bytes());
        key[10..].copy_from_slice(&((self.replica_id as u16) ^ 0x8000).to_be_bytes());
        key
    }

    /// Inverse of [`Csn::to_key`].
    pub fn from_key(bytes: &[u8]) -> Result<Self, ChangelogError> {
        if bytes.len() != CSN_KEY_LEN {
            return Err(ChangelogError::InvalidCsn(format!(
                "expected {} key bytes, got {}",
                CSN_KEY_LEN,
                bytes.len()
            )));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[..8]);
        let timestamp = (u64::from_be_bytes(ts) ^ (1 << 63)) as i64;
        let seqnum = u16::from_be_bytes([bytes[8], bytes[9]]);
        let replica_id = (u16::from_be_bytes([bytes[10], bytes[11]]) ^ 0x8000) as i16;
        Ok(Self::new(timestamp, seqnum, replica_id))
    }
}

impl fmt::Display for Csn {
    /// Fixed-width hex: 16 digits timestamp, 4 seqnum, 4 replica id.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:04x}",
            self.timestamp as u64, self.seqnum, self.replica_id as u16
        )
    }
}

impl FromStr for Csn {
    type Err = ChangelogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 24 || !s.is_ascii() {
            return Err(ChangelogError::InvalidCsn(s.to_string()));
        }
        let bad = |_| ChangelogError::InvalidCsn(s.to_string());
        let timestamp = u64::from_str_radix(&s[..16], 16).map_err(bad)? as i64;
        let seqnum = u16::from_str_radix(&s[16..20], 16).map_err(bad)?;
        let replica_id = u16::from_str_radix(&s[20..], 16).map_err(bad)? as i16;
        Ok(Self::new(timestamp, seqnum, replica_id))
    }
}
