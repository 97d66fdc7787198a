//! Shutdown coordination between a replica and its collocated replication server.
//!
//! When a replica goes offline it sends a replica-offline notice per domain. The
//! replication server should forward that notice to its peers before it tears down,
//! but must not wait forever: after a grace window it may shut down regardless.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tracing::{debug, info};

use crate::clock::Clock;

const NOT_SENT: i64 = i64::MIN;

/// Tracks replica-offline notices not yet forwarded.
#[derive(Debug)]
pub struct ShutdownSync {
    pending: DashSet<String>,
    first_sent_at: AtomicI64,
    grace: Duration,
    clock: Arc<dyn Clock>,
}

impl ShutdownSync {
    /// Creates a synchronizer with the given grace window.
    pub fn new(grace: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            pending: DashSet::new(),
            first_sent_at: AtomicI64::new(NOT_SENT),
            grace,
            clock,
        }
    }

    /// Records that a replica-offline notice was sent for `domain_dn`.
    ///
    /// The first call starts the grace window for every domain.
    pub fn replica_offline_msg_sent(&self, domain_dn: &str) {
        let now = self.clock.now_millis();
        if self
            .first_sent_at
            .compare_exchange(NOT_SENT, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            info!(domain = domain_dn, "replica going offline, shutdown grace window started");
        }
        self.pending.insert(domain_dn.to_string());
    }

    /// Records that the notice for `domain_dn` reached the peers.
    pub fn replica_offline_msg_forwarded(&self, domain_dn: &str) {
        if self.pending.remove(domain_dn).is_some() {
            debug!(domain = domain_dn, "replica-offline notice forwarded");
        }
    }

    /// True when `domain_dn` has nothing pending or the grace window is over.
    pub fn can_shutdown(&self, domain_dn: &str) -> bool {
        if !self.pending.contains(domain_dn) {
            return true;
        }
        let sent_at = self.first_sent_at.load(Ordering::Acquire);
        sent_at != NOT_SENT && self.clock.now_millis() - sent_at > self.grace.as_millis() as i64
    }

    /// Domains whose notice is still pending.
    pub fn pending_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.pending.iter().map(|d| d.key().clone()).collect();
        domains.sort();
        domains
    }

    /// Polls [`ShutdownSync::can_shutdown`] every `poll` until it holds.
    pub async fn wait_until_can_shutdown(&self, domain_dn: &str, poll: Duration) {
        while !self.can_shutdown(domain_dn) {
            tokio::time::sleep(poll).await;
        }
    }
}
