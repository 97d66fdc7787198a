//! The changelog facade.
//!
//! [`ChangelogDb`] owns every replica log and the change number index, and runs the
//! purge loop and the change number indexer. Its lifecycle is
//! `Uninitialized -> Initialized -> ShutDown`, with `initialize_db` allowed again
//! after a shutdown and `remove_db` wiping everything.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dirrepl_store::StoreProvider;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cn_index_db::ChangeNumberIndexDb;
use crate::config::ChangelogConfig;
use crate::csn::Csn;
use crate::domain_registry::DomainRegistry;
use crate::error::{ChangelogError, Result};
use crate::indexer::{run_indexer, ChangeNumberIndexer};
use crate::purge::{purge_cycle, run_purge_loop, PurgeReport, PurgeSettings, PurgeTargets};
use crate::replica_db::ReplicaDb;
use crate::server_state::{MultiDomainServerState, ServerState};
use crate::task::BackgroundTask;

/// Store holding the domain registry.
pub const DOMAINS_STORE: &str = "domains";
/// Store holding the change number index.
pub const CN_INDEX_STORE: &str = "changenumberindex";
/// Store holding the indexing progress.
pub const CN_INDEX_STATE_STORE: &str = "changenumberindex.state";

/// Lifecycle state of a [`ChangelogDb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbState {
    /// Never initialized, or removed.
    Uninitialized,
    /// Logs open, background tasks running.
    Initialized,
    /// Logs closed.
    ShutDown,
}

struct Logs {
    provider: Arc<dyn StoreProvider>,
    registry: DomainRegistry,
    replicas: DashMap<(String, i16), Arc<ReplicaDb>>,
    cn_index: Arc<ChangeNumberIndexDb>,
    indexer: Arc<ChangeNumberIndexer>,
    offline: MultiDomainServerState,
}

impl Logs {
    fn open(provider: Arc<dyn StoreProvider>, excluded: HashSet<String>) -> Result<Self> {
        let registry = DomainRegistry::load(provider.open(DOMAINS_STORE)?)?;
        let replicas = DashMap::new();
        for (domain_dn, replica_id, name) in registry.replicas() {
            let db = ReplicaDb::open(domain_dn.clone(), replica_id, provider.open(&name)?)?;
            replicas.insert((domain_dn, replica_id), Arc::new(db));
        }
        let cn_index = Arc::new(ChangeNumberIndexDb::open(provider.open(CN_INDEX_STORE)?)?);
        let indexer = Arc::new(ChangeNumberIndexer::load(
            provider.open(CN_INDEX_STATE_STORE)?,
            excluded,
            &cn_index,
        )?);
        info!(
            domains = registry.domains().len(),
            replica_logs = replicas.len(),
            last_change_number = cn_index.last_generated_change_number(),
            "changelog logs opened"
        );
        Ok(Self {
            provider,
            registry,
            replicas,
            cn_index,
            indexer,
            offline: MultiDomainServerState::new(),
        })
    }

    fn replica_dbs(&self) -> Vec<Arc<ReplicaDb>> {
        let mut dbs: Vec<Arc<ReplicaDb>> =
            self.replicas.iter().map(|e| e.value().clone()).collect();
        dbs.sort_by(|a, b| {
            (a.domain_dn(), a.replica_id()).cmp(&(b.domain_dn(), b.replica_id()))
        });
        dbs
    }

    fn replica_db(&self, domain_dn: &str, replica_id: i16) -> Result<Arc<ReplicaDb>> {
        let key = (domain_dn.to_string(), replica_id);
        if let Some(db) = self.replicas.get(&key) {
            return Ok(db.value().clone());
        }
        let name = self.registry.ensure_replica(domain_dn, replica_id)?;
        let db = Arc::new(ReplicaDb::open(domain_dn, replica_id, self.provider.open(&name)?)?);
        Ok(self.replicas.entry(key).or_insert(db).value().clone())
    }

    fn open_cursor_count(&self) -> usize {
        self.replicas
            .iter()
            .map(|e| e.value().open_cursor_count())
            .sum::<usize>()
            + self.cn_index.open_cursor_count()
    }

    fn remove_domain(&self, domain_dn: &str) -> Result<()> {
        let dbs: Vec<Arc<ReplicaDb>> = self
            .replica_dbs()
            .into_iter()
            .filter(|db| db.domain_dn() == domain_dn)
            .collect();
        if let Some(busy) = dbs.iter().find(|db| db.open_cursor_count() > 0) {
            return Err(ChangelogError::IllegalState(format!(
                "cannot remove domain {} while replica {} has open cursors",
                domain_dn,
                busy.replica_id()
            )));
        }
        for db in &dbs {
            db.clear()?;
            db.close()?;
            self.replicas.remove(&(domain_dn.to_string(), db.replica_id()));
        }
        for name in self.registry.remove_domain(domain_dn)? {
            self.provider.remove(&name)?;
        }
        self.cn_index.remove_domain(domain_dn)?;
        self.indexer.forget_domain(domain_dn)?;
        self.offline.remove(domain_dn);
        info!(domain = domain_dn, replica_logs = dbs.len(), "domain removed from changelog");
        Ok(())
    }

    fn close_all(&self) -> Result<()> {
        let mut first_error = None;
        let mut results: Vec<Result<()>> = self.replica_dbs().iter().map(|db| db.close()).collect();
        results.push(self.cn_index.close());
        results.push(self.registry.flush());
        results.push(self.indexer.flush());
        for result in results {
            if let Err(e) = result {
                warn!(error = %e, "failed to close changelog log");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Owner of all replica logs and the change number index.
pub struct ChangelogDb {
    provider: Arc<dyn StoreProvider>,
    clock: Arc<dyn Clock>,
    excluded_domains: HashSet<String>,
    purge_interval: Duration,
    join_timeout: Duration,
    purge_delay_millis: Arc<AtomicU64>,
    compute_change_number: Arc<AtomicBool>,
    indexer_wakeup: Arc<Notify>,
    state: Mutex<DbState>,
    logs: RwLock<Option<Arc<Logs>>>,
    tasks: Mutex<Vec<BackgroundTask>>,
}

impl ChangelogDb {
    /// Creates an uninitialized changelog over `provider`.
    pub fn new(
        config: &ChangelogConfig,
        provider: Arc<dyn StoreProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            provider,
            clock,
            excluded_domains: config.excluded_domain_set(),
            purge_interval: config.purge_interval(),
            join_timeout: config.task_join_timeout(),
            purge_delay_millis: Arc::new(AtomicU64::new(config.purge_delay().as_millis() as u64)),
            compute_change_number: Arc::new(AtomicBool::new(config.compute_change_number)),
            indexer_wakeup: Arc::new(Notify::new()),
            state: Mutex::new(DbState::Uninitialized),
            logs: RwLock::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DbState {
        *self.state.lock()
    }

    /// Clock used to stamp and age changes.
    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Opens every persisted log and starts the purge loop and the indexer.
    ///
    /// Background tasks need a tokio runtime; without one, purging and indexing
    /// only happen through [`ChangelogDb::purge_once`] and
    /// [`ChangelogDb::index_pending`].
    pub fn initialize_db(&self) -> Result<()> {
        let mut state = self.state.lock();
        if *state == DbState::Initialized {
            return Err(ChangelogError::IllegalState(
                "changelog is already initialized".to_string(),
            ));
        }
        let logs = Arc::new(Logs::open(self.provider.clone(), self.excluded_domains.clone())?);
        *self.logs.write() = Some(logs.clone());
        *state = DbState::Initialized;
        drop(state);
        self.start_background_tasks(&logs);
        info!("changelog initialized");
        Ok(())
    }

    fn start_background_tasks(&self, logs: &Arc<Logs>) {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("no tokio runtime, purge and indexing only run on demand");
            return;
        }
        let settings = PurgeSettings {
            delay_millis: self.purge_delay_millis.clone(),
            compute_change_number: self.compute_change_number.clone(),
            interval: self.purge_interval,
            clock: self.clock.clone(),
        };
        let purge_logs = logs.clone();
        let purge_task = BackgroundTask::spawn("changelog-purge", move |token| {
            let cn_index = purge_logs.cn_index.clone();
            let indexer = purge_logs.indexer.clone();
            run_purge_loop(settings, move || purge_logs.replica_dbs(), cn_index, indexer, token)
        });

        let index_logs = logs.clone();
        let enabled = self.compute_change_number.clone();
        let wakeup = self.indexer_wakeup.clone();
        let index_task = BackgroundTask::spawn("changelog-indexer", move |token| {
            let cn_index = index_logs.cn_index.clone();
            let indexer = index_logs.indexer.clone();
            run_indexer(indexer, move || index_logs.replica_dbs(), cn_index, enabled, wakeup, token)
        });

        self.tasks.lock().extend([purge_task, index_task]);
        if self.compute_change_number() {
            self.indexer_wakeup.notify_one();
        }
    }

    fn logs(&self) -> Result<Arc<Logs>> {
        if *self.state.lock() != DbState::Initialized {
            return Err(ChangelogError::IllegalState(
                "changelog is not initialized".to_string(),
            ));
        }
        self.logs
            .read()
            .clone()
            .ok_or_else(|| ChangelogError::IllegalState("changelog has no open logs".to_string()))
    }

    /// Stops background tasks and flushes every log. Idempotent.
    pub async fn shutdown_db(&self) -> Result<()> {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.stop(self.join_timeout).await;
        }
        let logs = {
            let mut state = self.state.lock();
            if *state != DbState::Initialized {
                return Ok(());
            }
            *state = DbState::ShutDown;
            self.logs.read().clone()
        };
        if let Some(logs) = logs {
            logs.close_all()?;
        }
        info!("changelog shut down");
        Ok(())
    }

    /// Shuts down if needed and deletes every log. Fails while cursors are open.
    pub async fn remove_db(&self) -> Result<()> {
        if self.state() == DbState::Uninitialized {
            return Err(ChangelogError::IllegalState(
                "changelog was never initialized".to_string(),
            ));
        }
        let open = self
            .logs
            .read()
            .as_ref()
            .map(|logs| logs.open_cursor_count())
            .unwrap_or(0);
        if open > 0 {
            return Err(ChangelogError::IllegalState(format!(
                "cannot remove changelog with {} open cursors",
                open
            )));
        }
        self.shutdown_db().await?;
        *self.logs.write() = None;
        self.provider.remove_all()?;
        *self.state.lock() = DbState::Uninitialized;
        warn!("changelog removed");
        Ok(())
    }

    /// Log of `(domain_dn, replica_id)`, created on first use.
    pub fn replica_db(&self, domain_dn: &str, replica_id: i16) -> Result<Arc<ReplicaDb>> {
        self.logs()?.replica_db(domain_dn, replica_id)
    }

    /// Every replica log, ordered by domain then replica id.
    pub fn replica_dbs(&self) -> Result<Vec<Arc<ReplicaDb>>> {
        Ok(self.logs()?.replica_dbs())
    }

    /// The change number index.
    pub fn cn_index(&self) -> Result<Arc<ChangeNumberIndexDb>> {
        Ok(self.logs()?.cn_index.clone())
    }

    /// Registered domains in DN order.
    pub fn domains(&self) -> Result<Vec<String>> {
        Ok(self.logs()?.registry.domains())
    }

    /// Newest logged CSN of every replica of `domain_dn`.
    pub fn domain_server_state(&self, domain_dn: &str) -> Result<ServerState> {
        let state = ServerState::new();
        for db in self.logs()?.replica_dbs() {
            if db.domain_dn() == domain_dn {
                state.update(db.newest_csn());
            }
        }
        Ok(state)
    }

    /// Newest state of every indexed domain, minus `excluded`.
    pub fn newest_cookie(&self, excluded: &[String]) -> Result<MultiDomainServerState> {
        let cookie = MultiDomainServerState::new();
        for domain_dn in self.domains()? {
            if excluded.contains(&domain_dn) || self.is_excluded_from_index(&domain_dn) {
                continue;
            }
            let state = self.domain_server_state(&domain_dn)?;
            if !state.is_empty() {
                cookie.replace(&domain_dn, &state);
            }
        }
        Ok(cookie)
    }

    /// Oldest change number still in the index, else the last one handed out.
    pub fn oldest_change_number(&self) -> Result<i64> {
        let cn_index = self.cn_index()?;
        Ok(match cn_index.oldest_record()? {
            Some(record) => record.change_number,
            None => cn_index.last_generated_change_number(),
        })
    }

    /// Newest change number in the index, else the last one handed out.
    pub fn newest_change_number(&self) -> Result<i64> {
        let cn_index = self.cn_index()?;
        Ok(match cn_index.newest_record()? {
            Some(record) => record.change_number,
            None => cn_index.last_generated_change_number(),
        })
    }

    /// Deletes one domain: its replica logs, index records and indexing progress.
    pub fn remove_domain(&self, domain_dn: &str) -> Result<()> {
        self.logs()?.remove_domain(domain_dn)
    }

    /// Records that replica `csn.replica_id()` of `domain_dn` went offline at `csn`.
    pub fn notify_replica_offline(&self, domain_dn: &str, csn: Csn) -> Result<()> {
        let logs = self.logs()?;
        logs.replica_db(domain_dn, csn.replica_id())?;
        if logs.offline.update(domain_dn, csn) {
            info!(
                domain = domain_dn,
                replica_id = csn.replica_id(),
                %csn,
                "replica offline recorded"
            );
        }
        self.indexer_wakeup.notify_one();
        Ok(())
    }

    /// CSN at which a replica went offline, as long as it has logged nothing newer.
    pub fn replica_offline_csn(&self, domain_dn: &str, replica_id: i16) -> Result<Option<Csn>> {
        let logs = self.logs()?;
        let Some(offline) = logs.offline.max_csn(domain_dn, replica_id) else {
            return Ok(None);
        };
        let newest = logs.replica_db(domain_dn, replica_id)?.newest_csn();
        Ok(match newest {
            Some(newest) if newest >= offline => None,
            _ => Some(offline),
        })
    }

    /// Sets the purge delay; applies from the next purge cycle.
    pub fn set_purge_delay(&self, delay: Duration) {
        self.purge_delay_millis
            .store(delay.as_millis() as u64, Ordering::Release);
        info!(delay_secs = delay.as_secs(), "purge delay changed");
    }

    /// Current purge delay.
    pub fn purge_delay(&self) -> Duration {
        Duration::from_millis(self.purge_delay_millis.load(Ordering::Acquire))
    }

    /// Turns change number computation on or off; turning it on triggers a
    /// catch-up pass.
    pub fn set_compute_change_number(&self, enabled: bool) {
        let previous = self.compute_change_number.swap(enabled, Ordering::AcqRel);
        if enabled && !previous {
            info!("change number computation enabled, catching up");
            self.indexer_wakeup.notify_one();
        } else if !enabled && previous {
            info!("change number computation disabled");
        }
    }

    /// Whether change numbers are computed.
    pub fn compute_change_number(&self) -> bool {
        self.compute_change_number.load(Ordering::Acquire)
    }

    /// True for domains never assigned change numbers.
    pub fn is_excluded_from_index(&self, domain_dn: &str) -> bool {
        self.excluded_domains.contains(domain_dn)
    }

    /// Tells the indexer that new changes were logged.
    pub fn notify_new_change(&self) {
        self.indexer_wakeup.notify_one();
    }

    /// Runs one purge cycle now.
    pub fn purge_once(&self) -> Result<PurgeReport> {
        let logs = self.logs()?;
        let replicas = logs.replica_dbs();
        let targets = PurgeTargets {
            replicas: &replicas,
            cn_index: &logs.cn_index,
            indexer: self.compute_change_number().then_some(logs.indexer.as_ref()),
        };
        let report = purge_cycle(&targets, self.clock.now_millis(), self.purge_delay());
        debug!(?report, "purge cycle done");
        Ok(report)
    }

    /// Runs one indexing pass now; returns how many changes were indexed.
    pub fn index_pending(&self) -> Result<usize> {
        if !self.compute_change_number() {
            return Ok(0);
        }
        let logs = self.logs()?;
        logs.indexer.index_pending(&logs.replica_dbs(), &logs.cn_index)
    }

    /// Background tasks still running.
    pub fn running_task_count(&self) -> usize {
        self.tasks.lock().iter().filter(|t| !t.is_finished()).count()
    }

    /// Open cursors across every log.
    pub fn open_cursor_count(&self) -> Result<usize> {
        Ok(self.logs()?.open_cursor_count())
    }
}

impl std::fmt::Debug for ChangelogDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangelogDb")
            .field("state", &self.state())
            .field("purge_delay", &self.purge_delay())
            .field("compute_change_number", &self.compute_change_number())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::record::{ChangeRecord, Operation};
    use dirrepl_store::MemoryStoreProvider;

    fn changelog(
        config: ChangelogConfig,
    ) -> (Arc<MemoryStoreProvider>, Arc<ManualClock>, ChangelogDb) {
        let provider = Arc::new(MemoryStoreProvider::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let db = ChangelogDb::new(&config, provider.clone(), clock.clone());
        (provider, clock, db)
    }

    fn append(db: &ChangelogDb, domain: &str, ts: i64, replica: i16) {
        db.replica_db(domain, replica)
            .unwrap()
            .append(&ChangeRecord::new(
                Csn::new(ts, 0, replica),
                domain,
                Operation::Delete { dn: "cn=x".into() },
            ))
            .unwrap();
    }

    #[test]
    fn test_operations_require_initialization() {
        let (_, _, db) = changelog(ChangelogConfig::default());
        assert_eq!(db.state(), DbState::Uninitialized);
        assert!(matches!(db.replica_db("o=a", 1), Err(ChangelogError::IllegalState(_))));
        assert!(matches!(db.cn_index(), Err(ChangelogError::IllegalState(_))));
    }

    #[test]
    fn test_double_initialize_is_illegal() {
        let (_, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        assert!(matches!(db.initialize_db(), Err(ChangelogError::IllegalState(_))));
    }

    #[tokio::test]
    async fn test_reinitialize_after_shutdown_reopens_logs() {
        let (_, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        append(&db, "o=a", 10, 1);
        db.shutdown_db().await.unwrap();
        db.shutdown_db().await.unwrap();
        assert_eq!(db.state(), DbState::ShutDown);
        assert!(db.replica_db("o=a", 1).is_err());

        db.initialize_db().unwrap();
        assert_eq!(db.replica_db("o=a", 1).unwrap().newest_csn(), Some(Csn::new(10, 0, 1)));
        db.shutdown_db().await.unwrap();
    }

    #[test]
    fn test_replica_db_is_shared() {
        let (_, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        let a = db.replica_db("o=a", 1).unwrap();
        let b = db.replica_db("o=a", 1).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(db.domains().unwrap(), vec!["o=a".to_string()]);
    }

    #[test]
    fn test_domain_state_and_cookie() {
        let config = ChangelogConfig {
            excluded_domains: vec!["cn=schema".to_string()],
            ..Default::default()
        };
        let (_, _, db) = changelog(config);
        db.initialize_db().unwrap();
        append(&db, "o=a", 10, 1);
        append(&db, "o=a", 20, 2);
        append(&db, "o=b", 30, 1);
        append(&db, "cn=schema", 40, 1);

        let state = db.domain_server_state("o=a").unwrap();
        assert_eq!(state.max_csn(1), Some(Csn::new(10, 0, 1)));
        assert_eq!(state.max_csn(2), Some(Csn::new(20, 0, 2)));

        let cookie = db.newest_cookie(&["o=b".to_string()]).unwrap();
        assert_eq!(cookie.domains(), vec!["o=a".to_string()]);
    }

    #[test]
    fn test_index_pending_and_change_number_range() {
        let (_, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        assert_eq!(db.oldest_change_number().unwrap(), 0);
        append(&db, "o=a", 10, 1);
        append(&db, "o=b", 5, 2);
        assert_eq!(db.index_pending().unwrap(), 2);
        assert_eq!(db.oldest_change_number().unwrap(), 1);
        assert_eq!(db.newest_change_number().unwrap(), 2);
        let first = db.cn_index().unwrap().oldest_record().unwrap().unwrap();
        assert_eq!(first.csn, Csn::new(5, 0, 2));
    }

    #[test]
    fn test_disabled_computation_skips_indexing() {
        let config = ChangelogConfig {
            compute_change_number: false,
            ..Default::default()
        };
        let (_, _, db) = changelog(config);
        db.initialize_db().unwrap();
        append(&db, "o=a", 10, 1);
        assert_eq!(db.index_pending().unwrap(), 0);
        db.set_compute_change_number(true);
        assert_eq!(db.index_pending().unwrap(), 1);
    }

    #[test]
    fn test_purge_once_uses_current_delay() {
        let (_, clock, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        append(&db, "o=a", 10, 1);
        append(&db, "o=a", 20, 1);
        db.index_pending().unwrap();

        db.set_purge_delay(Duration::ZERO);
        assert_eq!(db.purge_once().unwrap().cutoff, None);

        db.set_purge_delay(Duration::from_millis(100));
        clock.set(1_000);
        let report = db.purge_once().unwrap();
        assert_eq!(report.cutoff, Some(Csn::new(900, 0, 0)));
        let log = db.replica_db("o=a", 1).unwrap();
        assert_eq!(log.oldest_csn().unwrap(), Some(Csn::new(20, 0, 1)));
        assert_eq!(db.oldest_change_number().unwrap(), 2);
    }

    #[test]
    fn test_remove_domain() {
        let (provider, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        append(&db, "o=a", 10, 1);
        append(&db, "o=b", 20, 1);
        db.index_pending().unwrap();

        let cursor = db.replica_db("o=a", 1).unwrap().cursor_after(None).unwrap();
        assert!(matches!(db.remove_domain("o=a"), Err(ChangelogError::IllegalState(_))));
        drop(cursor);

        db.remove_domain("o=a").unwrap();
        assert_eq!(db.domains().unwrap(), vec!["o=b".to_string()]);
        assert!(!provider.exists("0.dom/1.server").unwrap());
        assert!(db.replica_db("o=a", 1).unwrap().newest_csn().is_none());
    }

    #[tokio::test]
    async fn test_remove_db_refused_with_open_cursor() {
        let (provider, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        append(&db, "o=a", 10, 1);
        let cursor = db.cn_index().unwrap().new_cursor(1).unwrap();
        assert!(matches!(db.remove_db().await, Err(ChangelogError::IllegalState(_))));
        drop(cursor);

        db.remove_db().await.unwrap();
        assert_eq!(db.state(), DbState::Uninitialized);
        assert!(!provider.exists(DOMAINS_STORE).unwrap());
        db.initialize_db().unwrap();
        assert!(db.domains().unwrap().is_empty());
        db.shutdown_db().await.unwrap();
    }

    #[test]
    fn test_no_runtime_means_no_tasks() {
        let (_, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        assert_eq!(db.running_task_count(), 0);
    }

    #[tokio::test]
    async fn test_background_indexer_follows_notifications() {
        let (_, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        assert_eq!(db.running_task_count(), 2);
        append(&db, "o=a", 10, 1);
        db.notify_new_change();
        for _ in 0..200 {
            if db.newest_change_number().unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(db.newest_change_number().unwrap(), 1);
        db.shutdown_db().await.unwrap();
        assert_eq!(db.running_task_count(), 0);
    }

    #[test]
    fn test_replica_offline_until_newer_change() {
        let (_, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        append(&db, "o=a", 10, 2);
        assert_eq!(db.replica_offline_csn("o=a", 2).unwrap(), None);

        db.notify_replica_offline("o=a", Csn::new(20, 0, 2)).unwrap();
        db.notify_replica_offline("o=a", Csn::new(15, 0, 2)).unwrap();
        assert_eq!(db.replica_offline_csn("o=a", 2).unwrap(), Some(Csn::new(20, 0, 2)));

        append(&db, "o=a", 30, 2);
        assert_eq!(db.replica_offline_csn("o=a", 2).unwrap(), None);
    }

    #[test]
    fn test_offline_replica_is_registered_and_forgotten_with_domain() {
        let (_, _, db) = changelog(ChangelogConfig::default());
        db.initialize_db().unwrap();
        db.notify_replica_offline("o=b", Csn::new(5, 0, 4)).unwrap();
        assert_eq!(db.domains().unwrap(), vec!["o=b".to_string()]);
        assert_eq!(db.replica_offline_csn("o=b", 4).unwrap(), Some(Csn::new(5, 0, 4)));

        db.remove_domain("o=b").unwrap();
        assert_eq!(db.replica_offline_csn("o=b", 4).unwrap(), None);
    }
}
