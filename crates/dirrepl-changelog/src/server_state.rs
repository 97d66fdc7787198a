//! Per-replica progress vectors.
//!
//! A [`ServerState`] records, for each replica id, the newest CSN known from that
//! replica. A [`MultiDomainServerState`] holds one of them per replication domain
//! and doubles as the external changelog cookie.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::RwLock;

use crate::csn::{Csn, CSN_KEY_LEN};
use crate::error::{ChangelogError, Result};

/// Newest CSN seen per replica id. Slots only ever move forward.
#[derive(Debug, Default)]
pub struct ServerState {
    slots: RwLock<BTreeMap<i16, Csn>>,
}

impl ServerState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` if it is newer than the slot of its replica.
    ///
    /// Returns false, leaving the state untouched, for `None` or a CSN that is not
    /// strictly newer.
    pub fn update(&self, csn: impl Into<Option<Csn>>) -> bool {
        let Some(csn) = csn.into() else {
            return false;
        };
        let mut slots = self.slots.write();
        match slots.get(&csn.replica_id()) {
            Some(current) if *current >= csn => false,
            _ => {
                slots.insert(csn.replica_id(), csn);
                true
            }
        }
    }

    /// Replaces every slot with a copy of `other`.
    pub fn reload(&self, other: &ServerState) {
        let copy = other.snapshot();
        *self.slots.write() = copy;
    }

    /// Newest CSN known for `replica_id`.
    pub fn max_csn(&self, replica_id: i16) -> Option<Csn> {
        self.slots.read().get(&replica_id).copied()
    }

    /// Newest CSN across all replicas.
    pub fn newest_csn(&self) -> Option<Csn> {
        self.slots.read().values().max().copied()
    }

    /// True when `csn` is already covered by the slot of its replica.
    pub fn cover(&self, csn: &Csn) -> bool {
        self.max_csn(csn.replica_id())
            .map(|max| max >= *csn)
            .unwrap_or(false)
    }

    /// True when no replica has a slot.
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    /// Replica ids with a slot, ascending.
    pub fn replica_ids(&self) -> Vec<i16> {
        self.slots.read().keys().copied().collect()
    }

    /// Immutable copy of all slots.
    pub fn snapshot(&self) -> BTreeMap<i16, Csn> {
        self.slots.read().clone()
    }

    /// Compact encoding: entry count (u16, big-endian) then one CSN key per slot.
    pub fn to_bytes(&self) -> Vec<u8> {
        let slots = self.slots.read();
        let mut out = Vec::with_capacity(2 + slots.len() * CSN_KEY_LEN);
        out.extend_from_slice(&(slots.len() as u16).to_be_bytes());
        for csn in slots.values() {
            out.extend_from_slice(&csn.to_key());
        }
        out
    }

    /// Decodes the output of [`ServerState::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 {
            return Err(ChangelogError::InvalidServerState(
                "missing entry count".to_string(),
            ));
        }
        let count = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        let body = &bytes[2..];
        if body.len() != count * CSN_KEY_LEN {
            return Err(ChangelogError::InvalidServerState(format!(
                "{} entries need {} bytes, got {}",
                count,
                count * CSN_KEY_LEN,
                body.len()
            )));
        }
        let state = ServerState::new();
        for chunk in body.chunks_exact(CSN_KEY_LEN) {
            let csn = Csn::from_key(chunk)?;
            if !state.update(csn) {
                return Err(ChangelogError::InvalidServerState(format!(
                    "duplicate slot for replica {}",
                    csn.replica_id()
                )));
            }
        }
        Ok(state)
    }
}

impl Clone for ServerState {
    fn clone(&self) -> Self {
        Self {
            slots: RwLock::new(self.snapshot()),
        }
    }
}

impl PartialEq for ServerState {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl Eq for ServerState {}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.read();
        let mut first = true;
        for csn in slots.values() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{}", csn)?;
            first = false;
        }
        Ok(())
    }
}

/// One [`ServerState`] per replication domain.
#[derive(Debug, Default)]
pub struct MultiDomainServerState {
    domains: RwLock<BTreeMap<String, ServerState>>,
}

impl MultiDomainServerState {
    /// Creates an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `csn` for `domain_dn`; see [`ServerState::update`].
    pub fn update(&self, domain_dn: &str, csn: Csn) -> bool {
        if let Some(state) = self.domains.read().get(domain_dn) {
            return state.update(csn);
        }
        self.domains
            .write()
            .entry(domain_dn.to_string())
            .or_default()
            .update(csn)
    }

    /// Replaces the state of `domain_dn` with a copy of `state`.
    pub fn replace(&self, domain_dn: &str, state: &ServerState) {
        self.domains
            .write()
            .insert(domain_dn.to_string(), state.clone());
    }

    /// Copy of the state of `domain_dn`.
    pub fn get(&self, domain_dn: &str) -> Option<ServerState> {
        self.domains.read().get(domain_dn).cloned()
    }

    /// Newest CSN of `replica_id` in `domain_dn`.
    pub fn max_csn(&self, domain_dn: &str, replica_id: i16) -> Option<Csn> {
        self.domains
            .read()
            .get(domain_dn)
            .and_then(|s| s.max_csn(replica_id))
    }

    /// Drops `domain_dn`, returning whether it was present.
    pub fn remove(&self, domain_dn: &str) -> bool {
        self.domains.write().remove(domain_dn).is_some()
    }

    /// Domains with a state, in DN order.
    pub fn domains(&self) -> Vec<String> {
        self.domains.read().keys().cloned().collect()
    }

    /// True when no domain has a state.
    pub fn is_empty(&self) -> bool {
        self.domains.read().is_empty()
    }

    /// Serialized form: a bincode list of `(domain_dn, ServerState bytes)`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let entries: Vec<(String, Vec<u8>)> = self
            .domains
            .read()
            .iter()
            .map(|(dn, state)| (dn.clone(), state.to_bytes()))
            .collect();
        Ok(bincode::serialize(&entries)?)
    }

    /// Decodes the output of [`MultiDomainServerState::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let entries: Vec<(String, Vec<u8>)> = bincode::deserialize(bytes)?;
        let mut domains = BTreeMap::new();
        for (dn, state) in entries {
            domains.insert(dn, ServerState::from_bytes(&state)?);
        }
        Ok(Self {
            domains: RwLock::new(domains),
        })
    }
}

impl Clone for MultiDomainServerState {
    fn clone(&self) -> Self {
        Self {
            domains: RwLock::new(self.domains.read().clone()),
        }
    }
}

impl PartialEq for MultiDomainServerState {
    fn eq(&self, other: &Self) -> bool {
        *self.domains.read() == *other.domains.read()
    }
}

impl fmt::Display for MultiDomainServerState {
    /// Cookie form: `dn:csn csn;dn:csn;`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (dn, state) in self.domains.read().iter() {
            write!(f, "{}:{};", dn, state)?;
        }
        Ok(())
    }
}
