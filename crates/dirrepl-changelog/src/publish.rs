//! Entry point for changes entering the changelog.
//!
//! [`ReplicationService`] stamps local writes with CSNs, logs them, logs changes
//! received from peers, and forwards logged changes to sessions.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::changelog_db::ChangelogDb;
use crate::csn::Csn;
use crate::csn_generator::CsnGenerator;
use crate::error::Result;
use crate::record::{ChangeRecord, Operation};
use crate::server_state::ServerState;
use crate::session::{ReplicationMsg, Session};
use crate::shutdown_sync::ShutdownSync;

struct DomainContext {
    generator: CsnGenerator,
    state: ServerState,
    append_lock: Mutex<()>,
}

/// Publishes and receives changes for every domain of the local replica.
pub struct ReplicationService {
    changelog: Arc<ChangelogDb>,
    local_replica_id: i16,
    shutdown_sync: Arc<ShutdownSync>,
    domains: DashMap<String, Arc<DomainContext>>,
}

impl ReplicationService {
    /// Creates a service writing to `changelog` as `local_replica_id`.
    pub fn new(
        changelog: Arc<ChangelogDb>,
        local_replica_id: i16,
        shutdown_sync: Arc<ShutdownSync>,
    ) -> Self {
        Self {
            changelog,
            local_replica_id,
            shutdown_sync,
            domains: DashMap::new(),
        }
    }

    /// Replica id stamped on local changes.
    pub fn local_replica_id(&self) -> i16 {
        self.local_replica_id
    }

    fn domain(&self, domain_dn: &str) -> Result<Arc<DomainContext>> {
        if let Some(ctx) = self.domains.get(domain_dn) {
            return Ok(ctx.value().clone());
        }
        let state = self.changelog.domain_server_state(domain_dn)?;
        let ctx = Arc::new(DomainContext {
            generator: CsnGenerator::with_state(
                self.local_replica_id,
                self.changelog.clock(),
                &state,
            ),
            state,
            append_lock: Mutex::new(()),
        });
        debug!(domain = domain_dn, state = %ctx.state, "domain context created");
        Ok(self
            .domains
            .entry(domain_dn.to_string())
            .or_insert(ctx)
            .value()
            .clone())
    }

    /// Stamps `operation` with a new CSN and logs it durably.
    ///
    /// Returns once the change is on disk; indexing happens in the background.
    pub fn publish(&self, domain_dn: &str, operation: Operation) -> Result<Csn> {
        let ctx = self.domain(domain_dn)?;
        let log = self.changelog.replica_db(domain_dn, self.local_replica_id)?;
        let csn = {
            let _append = ctx.append_lock.lock();
            let csn = ctx.generator.next();
            log.append(&ChangeRecord::new(csn, domain_dn, operation))?;
            csn
        };
        ctx.state.update(csn);
        self.changelog.notify_new_change();
        trace!(domain = domain_dn, %csn, "change published");
        Ok(csn)
    }

    /// Logs a change received from a peer. Returns false for an already known change.
    pub fn apply_remote(&self, record: ChangeRecord) -> Result<bool> {
        let ctx = self.domain(&record.domain_dn)?;
        let csn = record.csn;
        {
            let _append = ctx.append_lock.lock();
            if ctx.state.cover(&csn) {
                trace!(domain = %record.domain_dn, %csn, "duplicate change ignored");
                return Ok(false);
            }
            let log = self.changelog.replica_db(&record.domain_dn, csn.replica_id())?;
            log.append(&record)?;
            ctx.state.update(csn);
        }
        ctx.generator.adjust(csn);
        self.changelog.notify_new_change();
        Ok(true)
    }

    /// Handles one message received from a peer.
    pub fn handle_message(&self, msg: ReplicationMsg) -> Result<()> {
        match msg {
            ReplicationMsg::Update(record) => {
                self.apply_remote(record)?;
            }
            ReplicationMsg::Heartbeat { csn } => {
                trace!(%csn, "heartbeat received");
            }
            ReplicationMsg::ReplicaOffline { domain_dn, csn } => {
                info!(
                    domain = %domain_dn,
                    replica_id = csn.replica_id(),
                    "peer replica went offline"
                );
                self.changelog.notify_replica_offline(&domain_dn, csn)?;
            }
        }
        Ok(())
    }

    /// Progress of `domain_dn` as seen by this service.
    pub fn server_state(&self, domain_dn: &str) -> Result<ServerState> {
        Ok(self.domain(domain_dn)?.state.clone())
    }

    /// Sends the changes of one replica log strictly after `after` to `session`.
    ///
    /// Returns the CSN of the last change sent, or `after` when nothing was sent.
    pub async fn forward_changes(
        &self,
        session: &dyn Session,
        domain_dn: &str,
        replica_id: i16,
        after: Option<Csn>,
    ) -> Result<Option<Csn>> {
        let log = self.changelog.replica_db(domain_dn, replica_id)?;
        let mut cursor = log.cursor_after(after)?;
        let mut last = after;
        while cursor.next()? {
            let Some(record) = cursor.record().cloned() else {
                break;
            };
            let csn = record.csn;
            session.publish(ReplicationMsg::Update(record)).await?;
            last = Some(csn);
        }
        Ok(last)
    }

    /// Builds the replica-offline notice of `domain_dn` and records it as sent.
    pub fn replica_offline(&self, domain_dn: &str) -> Result<ReplicationMsg> {
        let ctx = self.domain(domain_dn)?;
        let csn = ctx.generator.next();
        self.shutdown_sync.replica_offline_msg_sent(domain_dn);
        Ok(ReplicationMsg::ReplicaOffline {
            domain_dn: domain_dn.to_string(),
            csn,
        })
    }

    /// Sends a replica-offline notice to every peer session.
    ///
    /// The notice counts as forwarded only when every session accepted it. Peers
    /// that cannot be reached are logged; the domain then stays pending and
    /// [`ShutdownSync::can_shutdown`] waits out the grace window. Returns whether
    /// every peer was informed.
    pub async fn forward_replica_offline(
        &self,
        sessions: &[Arc<dyn Session>],
        msg: ReplicationMsg,
    ) -> bool {
        let domain_dn = match &msg {
            ReplicationMsg::ReplicaOffline { domain_dn, .. } => domain_dn.clone(),
            other => {
                warn!(?other, "not a replica-offline notice, ignoring");
                return false;
            }
        };
        let mut failed = 0;
        for session in sessions {
            if let Err(e) = session.publish(msg.clone()).await {
                warn!(domain = %domain_dn, error = %e, "could not forward replica-offline notice");
                failed += 1;
            }
        }
        if failed > 0 {
            warn!(
                domain = %domain_dn,
                failed,
                peers = sessions.len(),
                "replica-offline notice not delivered to every peer"
            );
            return false;
        }
        self.shutdown_sync.replica_offline_msg_forwarded(&domain_dn);
        true
    }

    /// True when `domain_dn` may be torn down; see [`ShutdownSync::can_shutdown`].
    pub fn can_shutdown(&self, domain_dn: &str) -> bool {
        self.shutdown_sync.can_shutdown(domain_dn)
    }

    /// Drops cached per-domain state, e.g. after the changelog was re-initialized.
    pub fn reset(&self) {
        self.domains.clear();
    }
}

impl std::fmt::Debug for ReplicationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationService")
            .field("local_replica_id", &self.local_replica_id)
            .field("domains", &self.domains.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ChangelogConfig;
    use crate::error::ChangelogError;
    use crate::session::ChannelSession;
    use dirrepl_store::MemoryStoreProvider;
    use std::time::Duration;

    fn service(replica_id: i16) -> (Arc<ManualClock>, Arc<ChangelogDb>, ReplicationService) {
        let clock = Arc::new(ManualClock::new(1_000));
        let changelog = Arc::new(ChangelogDb::new(
            &ChangelogConfig::default(),
            Arc::new(MemoryStoreProvider::new()),
            clock.clone(),
        ));
        changelog.initialize_db().unwrap();
        let sync = Arc::new(ShutdownSync::new(Duration::from_secs(5), clock.clone()));
        let service = ReplicationService::new(changelog.clone(), replica_id, sync);
        (clock, changelog, service)
    }

    fn delete(dn: &str) -> Operation {
        Operation::Delete { dn: dn.to_string() }
    }

    #[test]
    fn test_publish_logs_and_updates_state() {
        let (_, changelog, service) = service(1);
        let a = service.publish("o=test", delete("cn=a,o=test")).unwrap();
        let b = service.publish("o=test", delete("cn=b,o=test")).unwrap();
        assert!(b > a);
        assert_eq!(a.replica_id(), 1);
        assert_eq!(service.server_state("o=test").unwrap().max_csn(1), Some(b));
        let log = changelog.replica_db("o=test", 1).unwrap();
        assert_eq!(log.record_count().unwrap(), 2);
        assert_eq!(changelog.index_pending().unwrap(), 2);
    }

    #[test]
    fn test_generator_resumes_after_logged_changes() {
        let (clock, changelog, service) = service(1);
        let first = service.publish("o=test", delete("cn=a")).unwrap();
        clock.set(10);
        let fresh = ReplicationService::new(
            changelog,
            1,
            Arc::new(ShutdownSync::new(Duration::from_secs(5), clock.clone())),
        );
        let next = fresh.publish("o=test", delete("cn=b")).unwrap();
        assert!(next > first);
    }

    #[test]
    fn test_apply_remote_ignores_duplicates_and_adjusts_generator() {
        let (_, changelog, service) = service(1);
        let remote = ChangeRecord::new(Csn::new(50_000, 3, 2), "o=test", delete("cn=r"));
        assert!(service.apply_remote(remote.clone()).unwrap());
        assert!(!service.apply_remote(remote).unwrap());
        assert_eq!(changelog.replica_db("o=test", 2).unwrap().record_count().unwrap(), 1);
        let local = service.publish("o=test", delete("cn=l")).unwrap();
        assert!(local > Csn::new(50_000, 3, 2));
    }

    #[test]
    fn test_apply_remote_older_than_slot_is_ignored() {
        let (_, _, service) = service(1);
        service
            .apply_remote(ChangeRecord::new(Csn::new(50, 0, 2), "o=test", delete("cn=a")))
            .unwrap();
        service
            .apply_remote(ChangeRecord::new(Csn::new(60, 0, 3), "o=test", delete("cn=b")))
            .unwrap();
        assert!(!service
            .apply_remote(ChangeRecord::new(Csn::new(40, 0, 2), "o=test", delete("cn=c")))
            .unwrap());
    }

    #[tokio::test]
    async fn test_forward_changes_to_session() {
        let (clock, _, service) = service(1);
        let a = service.publish("o=test", delete("cn=a")).unwrap();
        let b = service.publish("o=test", delete("cn=b")).unwrap();
        let (local, peer) = ChannelSession::pair(clock, 8);

        let last = service.forward_changes(&local, "o=test", 1, None).await.unwrap();
        assert_eq!(last, Some(b));
        let mut csns = Vec::new();
        while let Some(ReplicationMsg::Update(record)) = peer.try_receive() {
            csns.push(record.csn);
        }
        assert_eq!(csns, vec![a, b]);

        let last = service.forward_changes(&local, "o=test", 1, Some(b)).await.unwrap();
        assert_eq!(last, Some(b));
        assert!(peer.try_receive().is_none());
    }

    #[tokio::test]
    async fn test_forward_failure_releases_cursor() {
        let (clock, changelog, service) = service(1);
        service.publish("o=test", delete("cn=a")).unwrap();
        let (local, peer) = ChannelSession::pair(clock, 8);
        drop(peer);
        let err = service.forward_changes(&local, "o=test", 1, None).await.unwrap_err();
        assert!(matches!(err, ChangelogError::Transport(_)));
        assert_eq!(changelog.open_cursor_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replica_offline_round_trip() {
        let (clock, _, service) = service(1);
        let (local, peer) = ChannelSession::pair(clock, 8);
        let msg = service.replica_offline("o=test").unwrap();
        assert!(!service.can_shutdown("o=test"));

        let sessions: Vec<Arc<dyn Session>> = vec![Arc::new(local)];
        assert!(service.forward_replica_offline(&sessions, msg.clone()).await);
        assert!(service.can_shutdown("o=test"));
        assert_eq!(peer.try_receive(), Some(msg));
    }

    #[tokio::test]
    async fn test_undelivered_offline_notice_waits_for_grace_window() {
        let (clock, _, service) = service(1);
        let (local, peer) = ChannelSession::pair(clock.clone(), 8);
        drop(peer);
        let msg = service.replica_offline("o=test").unwrap();

        let sessions: Vec<Arc<dyn Session>> = vec![Arc::new(local)];
        assert!(!service.forward_replica_offline(&sessions, msg).await);
        assert!(!service.can_shutdown("o=test"));

        clock.advance(5_000);
        assert!(!service.can_shutdown("o=test"));
        clock.advance(1);
        assert!(service.can_shutdown("o=test"));
    }

    #[tokio::test]
    async fn test_offline_notice_needs_every_peer() {
        let (clock, _, service) = service(1);
        let (reachable, reachable_peer) = ChannelSession::pair(clock.clone(), 8);
        let (gone, gone_peer) = ChannelSession::pair(clock, 8);
        drop(gone_peer);
        let msg = service.replica_offline("o=test").unwrap();

        let sessions: Vec<Arc<dyn Session>> = vec![Arc::new(reachable), Arc::new(gone)];
        assert!(!service.forward_replica_offline(&sessions, msg.clone()).await);
        assert_eq!(reachable_peer.try_receive(), Some(msg));
        assert!(!service.can_shutdown("o=test"));
    }

    #[test]
    fn test_peer_offline_notice_is_recorded() {
        let (_, changelog, service) = service(1);
        let offline = Csn::new(2_000, 0, 3);
        service
            .handle_message(ReplicationMsg::ReplicaOffline {
                domain_dn: "o=test".to_string(),
                csn: offline,
            })
            .unwrap();
        assert_eq!(changelog.replica_offline_csn("o=test", 3).unwrap(), Some(offline));

        service
            .apply_remote(ChangeRecord::new(Csn::new(3_000, 0, 3), "o=test", delete("cn=back")))
            .unwrap();
        assert_eq!(changelog.replica_offline_csn("o=test", 3).unwrap(), None);
    }

    #[test]
    fn test_handle_message_applies_updates() {
        let (_, changelog, service) = service(1);
        service
            .handle_message(ReplicationMsg::Update(ChangeRecord::new(
                Csn::new(5, 0, 4),
                "o=test",
                delete("cn=x"),
            )))
            .unwrap();
        service
            .handle_message(ReplicationMsg::Heartbeat { csn: Csn::new(6, 0, 4) })
            .unwrap();
        assert_eq!(
            changelog.domain_server_state("o=test").unwrap().max_csn(4),
            Some(Csn::new(5, 0, 4))
        );
    }
}
