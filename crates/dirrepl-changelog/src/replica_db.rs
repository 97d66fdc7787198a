//! Append-only change log of one replica in one domain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dirrepl_store::{key_successor, KvStore};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::csn::Csn;
use crate::cursor::{CursorRegistry, DbCursor, KeyMatchingStrategy, PositionStrategy};
use crate::error::{ChangelogError, Result};
use crate::record::{ChangeRecord, ChangeRecordCodec, RecordCodec};

/// Cursor over a replica log.
pub type ReplicaCursor = DbCursor<ChangeRecordCodec>;

/// Outcome of a purge attempt that may give up on a busy log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeOutcome {
    /// The purge ran; carries the oldest CSN left.
    Purged(Option<Csn>),
    /// The log was busy and was skipped.
    Busy,
}

/// Log of the changes originated by one replica of one domain, keyed by CSN.
///
/// Appends must come in strictly increasing CSN order. Purging never removes the
/// newest record nor anything an open cursor can still read.
pub struct ReplicaDb {
    domain_dn: String,
    replica_id: i16,
    store: Arc<dyn KvStore>,
    cursors: Arc<CursorRegistry>,
    newest: Mutex<Option<Csn>>,
    closed: AtomicBool,
}

impl ReplicaDb {
    /// Opens the log over `store`, recovering the newest CSN.
    pub fn open(
        domain_dn: impl Into<String>,
        replica_id: i16,
        store: Arc<dyn KvStore>,
    ) -> Result<Self> {
        let newest = match store.last()? {
            Some((key, _)) => Some(Csn::from_key(&key)?),
            None => None,
        };
        let domain_dn = domain_dn.into();
        debug!(domain = %domain_dn, replica_id, newest = ?newest, "replica log opened");
        Ok(Self {
            domain_dn,
            replica_id,
            store,
            cursors: Arc::new(CursorRegistry::default()),
            newest: Mutex::new(newest),
            closed: AtomicBool::new(false),
        })
    }

    /// Domain of this log.
    pub fn domain_dn(&self) -> &str {
        &self.domain_dn
    }

    /// Replica owning this log.
    pub fn replica_id(&self) -> i16 {
        self.replica_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ChangelogError::Closed(format!(
                "{}/{}",
                self.domain_dn, self.replica_id
            )))
        } else {
            Ok(())
        }
    }

    /// Durably appends `record`.
    pub fn append(&self, record: &ChangeRecord) -> Result<()> {
        self.ensure_open()?;
        if record.domain_dn != self.domain_dn || record.csn.replica_id() != self.replica_id {
            return Err(ChangelogError::MisroutedRecord {
                domain_dn: self.domain_dn.clone(),
                replica_id: self.replica_id,
                record_domain: record.domain_dn.clone(),
                csn: record.csn,
            });
        }
        let mut newest = self.newest.lock();
        if let Some(last) = *newest {
            if record.csn <= last {
                return Err(ChangelogError::OrderingViolation {
                    domain_dn: self.domain_dn.clone(),
                    replica_id: self.replica_id,
                    newest: last,
                    attempted: record.csn,
                });
            }
        }
        self.store.put(
            ChangeRecordCodec::encode_key(&record.csn),
            ChangeRecordCodec::encode_value(record)?,
        )?;
        *newest = Some(record.csn);
        Ok(())
    }

    /// Opens a cursor; see [`KeyMatchingStrategy`] and [`PositionStrategy`].
    pub fn new_cursor(
        &self,
        start: Option<Csn>,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> Result<ReplicaCursor> {
        self.ensure_open()?;
        DbCursor::open(
            self.store.clone(),
            self.cursors.clone(),
            start,
            matching,
            position,
        )
    }

    /// Cursor over every record strictly after `after`, or over the whole log.
    ///
    /// Correct even when `after` itself was purged.
    pub fn cursor_after(&self, after: Option<Csn>) -> Result<ReplicaCursor> {
        self.new_cursor(
            after,
            KeyMatchingStrategy::LessThanOrEqualToKey,
            PositionStrategy::AfterMatchingKey,
        )
    }

    /// Oldest CSN in the log.
    pub fn oldest_csn(&self) -> Result<Option<Csn>> {
        match self.store.first()? {
            Some((key, _)) => Ok(Some(Csn::from_key(&key)?)),
            None => Ok(None),
        }
    }

    /// Newest CSN in the log.
    pub fn newest_csn(&self) -> Option<Csn> {
        *self.newest.lock()
    }

    /// Number of records.
    pub fn record_count(&self) -> Result<usize> {
        Ok(self.store.len()?)
    }

    /// Number of open cursors.
    pub fn open_cursor_count(&self) -> usize {
        self.cursors.open_count()
    }

    /// Removes records with CSN at or below `cutoff`; returns the oldest CSN left.
    pub fn purge_up_to(&self, cutoff: Csn) -> Result<Option<Csn>> {
        let newest = self.newest.lock();
        self.purge_locked(*newest, cutoff)
    }

    /// Like [`ReplicaDb::purge_up_to`], but gives up if appends hold the log for
    /// longer than `wait`.
    pub fn try_purge_up_to(&self, cutoff: Csn, wait: Duration) -> Result<PurgeOutcome> {
        match self.newest.try_lock_for(wait) {
            Some(newest) => Ok(PurgeOutcome::Purged(self.purge_locked(*newest, cutoff)?)),
            None => Ok(PurgeOutcome::Busy),
        }
    }

    fn purge_locked(&self, newest: Option<Csn>, cutoff: Csn) -> Result<Option<Csn>> {
        self.ensure_open()?;
        let Some(newest) = newest else {
            return Ok(None);
        };
        let newest_key = ChangeRecordCodec::encode_key(&newest);
        let cutoff_end = key_successor(&ChangeRecordCodec::encode_key(&cutoff));
        let end = cutoff_end.min(newest_key);
        let Some(end) = self.cursors.purge_limit(end) else {
            debug!(
                domain = %self.domain_dn,
                replica_id = self.replica_id,
                "purge held back by open cursor"
            );
            return self.oldest_csn();
        };
        let removed = self.store.delete_range(&[], &end)?;
        if removed > 0 {
            // Fold the range delete into a checkpoint so the store shrinks on disk.
            self.store.sync()?;
            debug!(
                domain = %self.domain_dn,
                replica_id = self.replica_id,
                removed,
                %cutoff,
                "purged replica log"
            );
        }
        self.oldest_csn()
    }

    /// Removes every record. Fails while cursors are open.
    pub fn clear(&self) -> Result<()> {
        let mut newest = self.newest.lock();
        let open = self.cursors.open_count();
        if open > 0 {
            return Err(ChangelogError::IllegalState(format!(
                "cannot clear {}/{} with {} open cursors",
                self.domain_dn, self.replica_id, open
            )));
        }
        self.store.clear()?;
        *newest = None;
        info!(domain = %self.domain_dn, replica_id = self.replica_id, "replica log cleared");
        Ok(())
    }

    /// Flushes the log to durable storage.
    pub fn flush(&self) -> Result<()> {
        Ok(self.store.sync()?)
    }

    /// Flushes and refuses further appends, purges and new cursors.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _newest = self.newest.lock();
            self.store.sync()?;
        }
        Ok(())
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ReplicaDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaDb")
            .field("domain_dn", &self.domain_dn)
            .field("replica_id", &self.replica_id)
            .field("newest", &self.newest_csn())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::KeyMatchingStrategy::*;
    use crate::cursor::PositionStrategy::*;
    use crate::record::Operation;
    use dirrepl_store::MemoryKvStore;

    const DOMAIN: &str = "o=test";

    fn csn(ts: i64) -> Csn {
        Csn::new(ts, 0, 1)
    }

    fn record(ts: i64) -> ChangeRecord {
        ChangeRecord::new(
            csn(ts),
            DOMAIN,
            Operation::Delete {
                dn: format!("cn={},o=test", ts),
            },
        )
    }

    fn log_with(timestamps: &[i64]) -> ReplicaDb {
        let db = ReplicaDb::open(DOMAIN, 1, Arc::new(MemoryKvStore::new())).unwrap();
        for ts in timestamps {
            db.append(&record(*ts)).unwrap();
        }
        db
    }

    fn read(
        db: &ReplicaDb,
        start: Option<i64>,
        m: KeyMatchingStrategy,
        p: PositionStrategy,
    ) -> Vec<i64> {
        let mut cursor = db.new_cursor(start.map(csn), m, p).unwrap();
        cursor
            .drain()
            .unwrap()
            .into_iter()
            .map(|r| r.csn.timestamp())
            .collect()
    }

    #[test]
    fn test_append_rejects_out_of_order() {
        let db = log_with(&[10, 20]);
        let err = db.append(&record(15)).unwrap_err();
        assert!(matches!(err, ChangelogError::OrderingViolation { .. }));
        assert!(matches!(
            db.append(&record(20)),
            Err(ChangelogError::OrderingViolation { .. })
        ));
        assert_eq!(db.record_count().unwrap(), 2);
    }

    #[test]
    fn test_append_rejects_other_replica_or_domain() {
        let db = log_with(&[]);
        let foreign =
            ChangeRecord::new(Csn::new(1, 0, 2), DOMAIN, Operation::Delete { dn: "cn=x".into() });
        assert!(matches!(db.append(&foreign), Err(ChangelogError::MisroutedRecord { .. })));
        let other_domain =
            ChangeRecord::new(csn(1), "o=other", Operation::Delete { dn: "cn=x".into() });
        assert!(matches!(db.append(&other_domain), Err(ChangelogError::MisroutedRecord { .. })));
    }

    #[test]
    fn test_oldest_newest() {
        let empty = log_with(&[]);
        assert_eq!(empty.oldest_csn().unwrap(), None);
        assert_eq!(empty.newest_csn(), None);
        let db = log_with(&[10, 20, 30]);
        assert_eq!(db.oldest_csn().unwrap(), Some(csn(10)));
        assert_eq!(db.newest_csn(), Some(csn(30)));
    }

    #[test]
    fn test_reopen_recovers_newest() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        {
            let db = ReplicaDb::open(DOMAIN, 1, store.clone()).unwrap();
            db.append(&record(10)).unwrap();
            db.append(&record(20)).unwrap();
        }
        let db = ReplicaDb::open(DOMAIN, 1, store).unwrap();
        assert_eq!(db.newest_csn(), Some(csn(20)));
        assert!(db.append(&record(15)).is_err());
    }

    #[test]
    fn test_cursor_grid_empty_log() {
        let db = log_with(&[]);
        for m in [EqualToKey, GreaterThanOrEqualToKey, LessThanOrEqualToKey] {
            for p in [OnMatchingKey, AfterMatchingKey] {
                assert!(read(&db, None, m, p).is_empty());
                assert!(read(&db, Some(10), m, p).is_empty());
            }
        }
    }

    #[test]
    fn test_cursor_grid_single_record() {
        let db = log_with(&[10]);
        assert_eq!(read(&db, Some(10), EqualToKey, OnMatchingKey), vec![10]);
        assert!(read(&db, Some(10), EqualToKey, AfterMatchingKey).is_empty());
        assert!(read(&db, Some(5), EqualToKey, OnMatchingKey).is_empty());
        assert_eq!(read(&db, Some(5), GreaterThanOrEqualToKey, OnMatchingKey), vec![10]);
        assert!(read(&db, Some(5), GreaterThanOrEqualToKey, AfterMatchingKey).is_empty());
        assert!(read(&db, Some(15), GreaterThanOrEqualToKey, OnMatchingKey).is_empty());
        assert_eq!(read(&db, Some(15), LessThanOrEqualToKey, OnMatchingKey), vec![10]);
        assert!(read(&db, Some(15), LessThanOrEqualToKey, AfterMatchingKey).is_empty());
    }

    #[test]
    fn test_cursor_grid_three_records() {
        let db = log_with(&[10, 20, 30]);
        // Null start.
        assert_eq!(read(&db, None, GreaterThanOrEqualToKey, OnMatchingKey), vec![10, 20, 30]);
        assert_eq!(read(&db, None, EqualToKey, AfterMatchingKey), vec![10, 20, 30]);
        // At an existing key.
        assert_eq!(read(&db, Some(20), EqualToKey, OnMatchingKey), vec![20, 30]);
        assert_eq!(read(&db, Some(20), EqualToKey, AfterMatchingKey), vec![30]);
        assert_eq!(read(&db, Some(20), GreaterThanOrEqualToKey, OnMatchingKey), vec![20, 30]);
        assert_eq!(read(&db, Some(20), GreaterThanOrEqualToKey, AfterMatchingKey), vec![30]);
        assert_eq!(read(&db, Some(20), LessThanOrEqualToKey, OnMatchingKey), vec![20, 30]);
        assert_eq!(read(&db, Some(20), LessThanOrEqualToKey, AfterMatchingKey), vec![30]);
        // Between keys.
        assert!(read(&db, Some(15), EqualToKey, OnMatchingKey).is_empty());
        assert_eq!(read(&db, Some(15), GreaterThanOrEqualToKey, OnMatchingKey), vec![20, 30]);
        assert_eq!(read(&db, Some(15), GreaterThanOrEqualToKey, AfterMatchingKey), vec![30]);
        assert_eq!(read(&db, Some(15), LessThanOrEqualToKey, OnMatchingKey), vec![10, 20, 30]);
        assert_eq!(read(&db, Some(15), LessThanOrEqualToKey, AfterMatchingKey), vec![20, 30]);
        // Before the first and after the last.
        assert_eq!(read(&db, Some(5), GreaterThanOrEqualToKey, OnMatchingKey), vec![10, 20, 30]);
        assert!(read(&db, Some(35), GreaterThanOrEqualToKey, OnMatchingKey).is_empty());
        assert!(read(&db, Some(30), GreaterThanOrEqualToKey, AfterMatchingKey).is_empty());
        assert_eq!(read(&db, Some(35), LessThanOrEqualToKey, OnMatchingKey), vec![30]);
    }

    #[test]
    fn test_purge_up_to_keeps_newest() {
        let db = log_with(&[10, 20, 30]);
        assert_eq!(db.purge_up_to(csn(20)).unwrap(), Some(csn(30)));
        assert_eq!(db.record_count().unwrap(), 1);
        assert_eq!(db.purge_up_to(csn(100)).unwrap(), Some(csn(30)));
        assert_eq!(db.record_count().unwrap(), 1);
    }

    #[test]
    fn test_purge_is_monotonic() {
        let db = log_with(&[10, 20, 30, 40]);
        let mut oldest = db.oldest_csn().unwrap();
        for cutoff in [5, 15, 15, 25, 35, 45] {
            let next = db.purge_up_to(csn(cutoff)).unwrap();
            assert!(next >= oldest);
            oldest = next;
        }
    }

    #[test]
    fn test_purge_stops_at_open_cursor() {
        let db = log_with(&[10, 20, 30, 40]);
        let mut cursor = db
            .new_cursor(Some(csn(20)), GreaterThanOrEqualToKey, OnMatchingKey)
            .unwrap();
        assert_eq!(db.purge_up_to(csn(35)).unwrap(), Some(csn(20)));
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.record().unwrap().csn, csn(20));
        assert!(cursor.next().unwrap());
        assert_eq!(db.purge_up_to(csn(35)).unwrap(), Some(csn(30)));
        assert!(cursor.next().unwrap());
        assert_eq!(cursor.record().unwrap().csn, csn(40));
        drop(cursor);
        assert_eq!(db.purge_up_to(csn(35)).unwrap(), Some(csn(40)));
    }

    #[test]
    fn test_cursor_after_purged_csn() {
        let db = log_with(&[10, 20, 30]);
        db.purge_up_to(csn(10)).unwrap();
        let mut cursor = db.cursor_after(Some(csn(10))).unwrap();
        let rest: Vec<i64> = cursor.drain().unwrap().iter().map(|r| r.csn.timestamp()).collect();
        assert_eq!(rest, vec![20, 30]);
    }

    #[test]
    fn test_cursor_from_start_pins_whole_log() {
        let db = log_with(&[10, 20]);
        let _cursor = db.cursor_after(None).unwrap();
        assert_eq!(db.purge_up_to(csn(15)).unwrap(), Some(csn(10)));
    }

    #[test]
    fn test_try_purge_busy() {
        let db = log_with(&[10, 20]);
        let _guard = db.newest.lock();
        assert_eq!(
            db.try_purge_up_to(csn(15), Duration::from_millis(1)).unwrap(),
            PurgeOutcome::Busy
        );
    }

    #[test]
    fn test_clear_refused_with_open_cursor() {
        let db = log_with(&[10]);
        let cursor = db.cursor_after(None).unwrap();
        assert!(matches!(db.clear(), Err(ChangelogError::IllegalState(_))));
        drop(cursor);
        db.clear().unwrap();
        assert_eq!(db.newest_csn(), None);
        db.append(&record(5)).unwrap();
    }

    #[test]
    fn test_closed_log_refuses_appends() {
        let db = log_with(&[10]);
        db.close().unwrap();
        assert!(matches!(db.append(&record(20)), Err(ChangelogError::Closed(_))));
        assert!(db.cursor_after(None).is_err());
    }
}
