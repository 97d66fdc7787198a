//! Best-effort removal of expired changelog records.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::cn_index_db::ChangeNumberIndexDb;
use crate::csn::Csn;
use crate::indexer::ChangeNumberIndexer;
use crate::replica_db::{PurgeOutcome, ReplicaDb};

/// How long a purge waits for a log busy with appends before skipping it.
const BUSY_LOG_WAIT: Duration = Duration::from_millis(50);

/// Summary of one purge cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    /// Cutoff applied, `None` when purging is disabled.
    pub cutoff: Option<Csn>,
    /// Replica logs purged.
    pub purged_logs: usize,
    /// Replica logs skipped because busy or not indexed yet.
    pub skipped_logs: usize,
    /// Logs whose purge failed.
    pub failed_logs: usize,
    /// Oldest change number left in the index.
    pub oldest_change_number: Option<i64>,
}

/// Logs a purge cycle works on.
pub(crate) struct PurgeTargets<'a> {
    pub(crate) replicas: &'a [Arc<ReplicaDb>],
    pub(crate) cn_index: &'a ChangeNumberIndexDb,
    /// Set when change numbers are computed: unindexed records are kept.
    pub(crate) indexer: Option<&'a ChangeNumberIndexer>,
}

/// Runs one purge cycle removing records older than `now_millis - delay`.
pub(crate) fn purge_cycle(
    targets: &PurgeTargets<'_>,
    now_millis: i64,
    delay: Duration,
) -> PurgeReport {
    let mut report = PurgeReport::default();
    if delay.is_zero() {
        return report;
    }
    let cutoff = Csn::new(now_millis.saturating_sub(delay.as_millis() as i64), 0, 0);
    report.cutoff = Some(cutoff);

    for db in targets.replicas {
        let mut log_cutoff = cutoff;
        if let Some(indexer) = targets.indexer {
            if !indexer.is_excluded(db.domain_dn()) {
                match indexer.indexed_up_to(db.domain_dn(), db.replica_id()) {
                    Some(indexed) => log_cutoff = log_cutoff.min(indexed),
                    None => {
                        report.skipped_logs += 1;
                        continue;
                    }
                }
            }
        }
        match db.try_purge_up_to(log_cutoff, BUSY_LOG_WAIT) {
            Ok(PurgeOutcome::Purged(_)) => report.purged_logs += 1,
            Ok(PurgeOutcome::Busy) => {
                debug!(
                    domain = db.domain_dn(),
                    replica_id = db.replica_id(),
                    "replica log busy, purge skipped"
                );
                report.skipped_logs += 1;
            }
            Err(e) => {
                warn!(
                    domain = db.domain_dn(),
                    replica_id = db.replica_id(),
                    error = %e,
                    "replica log purge failed"
                );
                report.failed_logs += 1;
            }
        }
    }

    match targets.cn_index.purge_up_to(cutoff) {
        Ok(oldest) => report.oldest_change_number = oldest.map(|r| r.change_number),
        Err(e) => {
            warn!(error = %e, "change number index purge failed");
            report.failed_logs += 1;
        }
    }
    report
}

/// Settings shared between the changelog and its purge loop.
#[derive(Debug, Clone)]
pub(crate) struct PurgeSettings {
    pub(crate) delay_millis: Arc<AtomicU64>,
    pub(crate) compute_change_number: Arc<AtomicBool>,
    pub(crate) interval: Duration,
    pub(crate) clock: Arc<dyn Clock>,
}

/// Purges on a fixed cadence until cancelled.
pub(crate) async fn run_purge_loop(
    settings: PurgeSettings,
    replicas: impl Fn() -> Vec<Arc<ReplicaDb>> + Send + 'static,
    cn_index: Arc<ChangeNumberIndexDb>,
    indexer: Arc<ChangeNumberIndexer>,
    token: CancellationToken,
) {
    info!(interval_ms = settings.interval.as_millis() as u64, "purge loop started");
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(settings.interval) => {}
        }
        let delay = Duration::from_millis(settings.delay_millis.load(Ordering::Acquire));
        if delay.is_zero() {
            continue;
        }
        let replicas = replicas();
        let indexing = settings.compute_change_number.load(Ordering::Acquire);
        let now = settings.clock.now_millis();
        let cycle_index = cn_index.clone();
        let cycle_indexer = indexer.clone();
        let cycle = tokio::task::spawn_blocking(move || {
            let targets = PurgeTargets {
                replicas: &replicas,
                cn_index: &cycle_index,
                indexer: indexing.then_some(cycle_indexer.as_ref()),
            };
            purge_cycle(&targets, now, delay)
        });
        match cycle.await {
            Ok(report) => debug!(
                purged = report.purged_logs,
                skipped = report.skipped_logs,
                failed = report.failed_logs,
                "purge cycle done"
            ),
            Err(e) => warn!(error = %e, "purge cycle aborted"),
        }
    }
    info!("purge loop stopped");
}
