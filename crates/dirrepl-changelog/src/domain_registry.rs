//! Persisted registry of domains and the replica logs they own.
//!
//! Domain DNs are mapped to small integers so log directories stay short and
//! filesystem-safe: the log of replica `r` in domain `n` is `"{n}.dom/{r}.server"`.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::sync::Arc;

use dirrepl_store::{BatchOp, KvStore};
use parking_lot::Mutex;
use tracing::info;

use crate::error::{ChangelogError, Result};

const DOMAIN_TAG: u8 = b'D';
const REPLICA_TAG: u8 = b'R';

fn domain_key(index: u32) -> Vec<u8> {
    let mut key = vec![DOMAIN_TAG];
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn replica_key(index: u32, replica_id: i16) -> Vec<u8> {
    let mut key = vec![REPLICA_TAG];
    key.extend_from_slice(&index.to_be_bytes());
    key.extend_from_slice(&((replica_id as u16) ^ 0x8000).to_be_bytes());
    key
}

/// Store name of a replica log.
pub(crate) fn replica_store_name(index: u32, replica_id: i16) -> String {
    format!("{}.dom/{}.server", index, replica_id)
}

#[derive(Debug, Default)]
struct Entries {
    index_of: BTreeMap<String, u32>,
    replicas: BTreeMap<String, BTreeSet<i16>>,
    next_index: u32,
}

/// Domain DN to index mapping plus the replica ids seen in each domain.
pub(crate) struct DomainRegistry {
    store: Arc<dyn KvStore>,
    entries: Mutex<Entries>,
}

impl DomainRegistry {
    /// Loads every entry from `store`.
    pub(crate) fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let mut entries = Entries::default();
        let mut dn_of = BTreeMap::new();
        let mut replica_rows = Vec::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            let bound = match &after {
                None => Bound::Unbounded,
                Some(k) => Bound::Excluded(k.as_slice()),
            };
            let Some((key, value)) = store.seek(bound)? else {
                break;
            };
            match (key.first().copied(), key.len()) {
                (Some(DOMAIN_TAG), 5) => {
                    let index = u32::from_be_bytes([key[1], key[2], key[3], key[4]]);
                    let dn = String::from_utf8(value).map_err(|e| {
                        ChangelogError::Corrupted(format!("domain {} name: {}", index, e))
                    })?;
                    entries.next_index = entries.next_index.max(index + 1);
                    entries.index_of.insert(dn.clone(), index);
                    dn_of.insert(index, dn);
                }
                (Some(REPLICA_TAG), 7) => {
                    let index = u32::from_be_bytes([key[1], key[2], key[3], key[4]]);
                    let replica_id = (u16::from_be_bytes([key[5], key[6]]) ^ 0x8000) as i16;
                    replica_rows.push((index, replica_id));
                }
                _ => {
                    return Err(ChangelogError::Corrupted(format!(
                        "unexpected domain registry key {:?}",
                        key
                    )))
                }
            }
            after = Some(key);
        }
        for (index, replica_id) in replica_rows {
            let dn = dn_of.get(&index).ok_or_else(|| {
                ChangelogError::Corrupted(format!(
                    "replica {} of unknown domain {}",
                    replica_id, index
                ))
            })?;
            entries
                .replicas
                .entry(dn.clone())
                .or_default()
                .insert(replica_id);
        }
        Ok(Self {
            store,
            entries: Mutex::new(entries),
        })
    }

    /// Registers `(domain_dn, replica_id)` if needed and returns its store name.
    pub(crate) fn ensure_replica(&self, domain_dn: &str, replica_id: i16) -> Result<String> {
        let mut entries = self.entries.lock();
        let mut ops = Vec::new();
        let (index, new_domain) = match entries.index_of.get(domain_dn) {
            Some(index) => (*index, false),
            None => {
                let index = entries.next_index;
                ops.push(BatchOp::Put {
                    key: domain_key(index),
                    value: domain_dn.as_bytes().to_vec(),
                });
                (index, true)
            }
        };
        let known = entries
            .replicas
            .get(domain_dn)
            .map(|ids| ids.contains(&replica_id))
            .unwrap_or(false);
        if !known {
            ops.push(BatchOp::Put {
                key: replica_key(index, replica_id),
                value: Vec::new(),
            });
        }
        if !ops.is_empty() {
            self.store.write_batch(ops)?;
            if new_domain {
                entries.next_index += 1;
                entries.index_of.insert(domain_dn.to_string(), index);
                info!(domain = domain_dn, index, "registered replication domain");
            }
            entries
                .replicas
                .entry(domain_dn.to_string())
                .or_default()
                .insert(replica_id);
        }
        Ok(replica_store_name(index, replica_id))
    }

    /// Every registered `(domain_dn, replica_id, store name)`.
    pub(crate) fn replicas(&self) -> Vec<(String, i16, String)> {
        let entries = self.entries.lock();
        let mut out = Vec::new();
        for (dn, ids) in &entries.replicas {
            if let Some(index) = entries.index_of.get(dn) {
                for id in ids {
                    out.push((dn.clone(), *id, replica_store_name(*index, *id)));
                }
            }
        }
        out
    }

    /// Registered domains in DN order.
    pub(crate) fn domains(&self) -> Vec<String> {
        self.entries.lock().index_of.keys().cloned().collect()
    }

    /// Unregisters a domain; returns the store names of its replica logs.
    pub(crate) fn remove_domain(&self, domain_dn: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        let Some(index) = entries.index_of.get(domain_dn).copied() else {
            return Ok(Vec::new());
        };
        let ids = entries.replicas.get(domain_dn).cloned().unwrap_or_default();
        let mut ops = vec![BatchOp::Delete {
            key: domain_key(index),
        }];
        ops.extend(ids.iter().map(|id| BatchOp::Delete {
            key: replica_key(index, *id),
        }));
        self.store.write_batch(ops)?;
        entries.index_of.remove(domain_dn);
        entries.replicas.remove(domain_dn);
        Ok(ids
            .into_iter()
            .map(|id| replica_store_name(index, id))
            .collect())
    }

    pub(crate) fn flush(&self) -> Result<()> {
        Ok(self.store.sync()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirrepl_store::MemoryKvStore;

    #[test]
    fn test_ensure_replica_assigns_stable_names() {
        let registry = DomainRegistry::load(Arc::new(MemoryKvStore::new())).unwrap();
        assert_eq!(registry.ensure_replica("o=a", 1).unwrap(), "0.dom/1.server");
        assert_eq!(registry.ensure_replica("o=b", 1).unwrap(), "1.dom/1.server");
        assert_eq!(registry.ensure_replica("o=a", -2).unwrap(), "0.dom/-2.server");
        assert_eq!(registry.ensure_replica("o=a", 1).unwrap(), "0.dom/1.server");
        assert_eq!(registry.domains(), vec!["o=a".to_string(), "o=b".to_string()]);
    }

    #[test]
    fn test_reload_restores_entries() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let registry = DomainRegistry::load(store.clone()).unwrap();
            registry.ensure_replica("o=a", 1).unwrap();
            registry.ensure_replica("o=a", 2).unwrap();
            registry.ensure_replica("dc=example,dc=com", 7).unwrap();
        }
        let registry = DomainRegistry::load(store).unwrap();
        assert_eq!(
            registry.replicas(),
            vec![
                ("dc=example,dc=com".to_string(), 7, "1.dom/7.server".to_string()),
                ("o=a".to_string(), 1, "0.dom/1.server".to_string()),
                ("o=a".to_string(), 2, "0.dom/2.server".to_string()),
            ]
        );
        assert_eq!(registry.ensure_replica("o=c", 1).unwrap(), "2.dom/1.server");
    }

    #[test]
    fn test_remove_domain() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let registry = DomainRegistry::load(store.clone()).unwrap();
        registry.ensure_replica("o=a", 1).unwrap();
        registry.ensure_replica("o=b", 1).unwrap();
        assert_eq!(registry.remove_domain("o=a").unwrap(), vec!["0.dom/1.server".to_string()]);
        assert!(registry.remove_domain("o=a").unwrap().is_empty());
        let reloaded = DomainRegistry::load(store).unwrap();
        assert_eq!(reloaded.domains(), vec!["o=b".to_string()]);
        assert_eq!(reloaded.ensure_replica("o=a", 1).unwrap(), "2.dom/1.server");
    }

    #[test]
    fn test_corrupt_key_is_rejected() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        store.put(b"junk".to_vec(), Vec::new()).unwrap();
        assert!(matches!(
            DomainRegistry::load(store),
            Err(ChangelogError::Corrupted(_))
        ));
    }
}
