//! Assigns change numbers to logged changes.
//!
//! The indexer remembers, per domain and replica, the newest CSN it has indexed.
//! A pass reads everything newer from the replica logs, merges it in CSN order and
//! appends it to the change number index. Progress is persisted after each record.

use std::collections::HashSet;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dirrepl_store::KvStore;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::cn_index_db::ChangeNumberIndexDb;
use crate::csn::Csn;
use crate::error::Result;
use crate::replica_db::ReplicaDb;
use crate::server_state::{MultiDomainServerState, ServerState};

/// Catch-up indexer of one changelog.
pub(crate) struct ChangeNumberIndexer {
    progress: MultiDomainServerState,
    state_store: Arc<dyn KvStore>,
    excluded: HashSet<String>,
    pass: Mutex<()>,
}

impl ChangeNumberIndexer {
    /// Loads persisted progress and reconciles it with the newest index record.
    pub(crate) fn load(
        state_store: Arc<dyn KvStore>,
        excluded: HashSet<String>,
        cn_index: &ChangeNumberIndexDb,
    ) -> Result<Self> {
        let progress = MultiDomainServerState::new();
        let mut after: Option<Vec<u8>> = None;
        loop {
            let bound = match &after {
                None => Bound::Unbounded,
                Some(k) => Bound::Excluded(k.as_slice()),
            };
            let Some((key, value)) = state_store.seek(bound)? else {
                break;
            };
            let domain_dn = String::from_utf8_lossy(&key).into_owned();
            progress.replace(&domain_dn, &ServerState::from_bytes(&value)?);
            after = Some(key);
        }
        let indexer = Self {
            progress,
            state_store,
            excluded,
            pass: Mutex::new(()),
        };
        // A crash between the index append and the progress write leaves the
        // newest index record unaccounted for.
        if let Some(newest) = cn_index.newest_record()? {
            if indexer.progress.update(&newest.domain_dn, newest.csn) {
                indexer.persist(&newest.domain_dn)?;
            }
        }
        Ok(indexer)
    }

    /// True for domains configured out of the change number index.
    pub(crate) fn is_excluded(&self, domain_dn: &str) -> bool {
        self.excluded.contains(domain_dn)
    }

    /// Newest CSN of `replica_id` already indexed in `domain_dn`.
    pub(crate) fn indexed_up_to(&self, domain_dn: &str, replica_id: i16) -> Option<Csn> {
        self.progress.max_csn(domain_dn, replica_id)
    }

    fn persist(&self, domain_dn: &str) -> Result<()> {
        if let Some(state) = self.progress.get(domain_dn) {
            self.state_store
                .put(domain_dn.as_bytes().to_vec(), state.to_bytes())?;
        }
        Ok(())
    }

    /// Indexes every change not indexed yet; returns how many were indexed.
    pub(crate) fn index_pending(
        &self,
        replicas: &[Arc<ReplicaDb>],
        cn_index: &ChangeNumberIndexDb,
    ) -> Result<usize> {
        let _pass = self.pass.lock();
        let mut pending: Vec<(Csn, &str)> = Vec::new();
        for db in replicas {
            if self.is_excluded(db.domain_dn()) {
                continue;
            }
            let after = self.indexed_up_to(db.domain_dn(), db.replica_id());
            let mut cursor = db.cursor_after(after)?;
            while cursor.next()? {
                if let Some(record) = cursor.record() {
                    pending.push((record.csn, db.domain_dn()));
                }
            }
        }
        pending.sort();
        for (csn, domain_dn) in &pending {
            let change_number = cn_index.add_record(domain_dn, *csn)?;
            self.progress.update(domain_dn, *csn);
            self.persist(domain_dn)?;
            trace!(change_number, domain = *domain_dn, %csn, "indexed change");
        }
        if !pending.is_empty() {
            debug!(indexed = pending.len(), "change number indexing pass done");
        }
        Ok(pending.len())
    }

    /// Forgets the progress of a removed domain.
    pub(crate) fn forget_domain(&self, domain_dn: &str) -> Result<()> {
        let _pass = self.pass.lock();
        self.progress.remove(domain_dn);
        Ok(self.state_store.delete(domain_dn.as_bytes())?)
    }

    pub(crate) fn flush(&self) -> Result<()> {
        Ok(self.state_store.sync()?)
    }
}

/// Runs indexing passes whenever `wakeup` fires, while `enabled` is set.
pub(crate) async fn run_indexer(
    indexer: Arc<ChangeNumberIndexer>,
    replicas: impl Fn() -> Vec<Arc<ReplicaDb>> + Send + 'static,
    cn_index: Arc<ChangeNumberIndexDb>,
    enabled: Arc<AtomicBool>,
    wakeup: Arc<Notify>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = wakeup.notified() => {}
        }
        if !enabled.load(Ordering::Acquire) {
            continue;
        }
        let replicas = replicas();
        let pass_indexer = indexer.clone();
        let pass_index = cn_index.clone();
        let pass = tokio::task::spawn_blocking(move || {
            pass_indexer.index_pending(&replicas, &pass_index)
        });
        match pass.await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "change number indexing failed, retrying on next change")
            }
            Err(e) => warn!(error = %e, "change number indexing pass aborted"),
        }
    }
    debug!("change number indexer stopped");
}
