//! Global change number index.
//!
//! Maps an external counter, assigned in strictly increasing order, to the
//! `(domain, CSN)` of each indexed change.

use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dirrepl_store::{key_successor, BatchOp, KvStore};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::csn::Csn;
use crate::cursor::{CursorRegistry, DbCursor, KeyMatchingStrategy, PositionStrategy};
use crate::error::{ChangelogError, Result};
use crate::record::{IndexRecord, IndexRecordCodec, RecordCodec};

/// Cursor over the change number index.
pub type IndexCursor = DbCursor<IndexRecordCodec>;

/// The change number index log.
///
/// The counter is recovered from the newest record on open. The newest record is
/// never purged, so a change number is never handed out twice.
pub struct ChangeNumberIndexDb {
    store: Arc<dyn KvStore>,
    cursors: Arc<CursorRegistry>,
    last_generated: Mutex<i64>,
    closed: AtomicBool,
}

impl ChangeNumberIndexDb {
    /// Opens the index over `store`.
    pub fn open(store: Arc<dyn KvStore>) -> Result<Self> {
        let last = match store.last()? {
            Some((key, _)) => IndexRecordCodec::decode_key(&key)?,
            None => 0,
        };
        debug!(last_change_number = last, "change number index opened");
        Ok(Self {
            store,
            cursors: Arc::new(CursorRegistry::default()),
            last_generated: Mutex::new(last),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(ChangelogError::Closed("changenumberindex".to_string()))
        } else {
            Ok(())
        }
    }

    /// Assigns the next change number to `(domain_dn, csn)` and appends it durably.
    pub fn add_record(&self, domain_dn: &str, csn: Csn) -> Result<i64> {
        self.ensure_open()?;
        let mut last = self.last_generated.lock();
        let record = IndexRecord {
            change_number: *last + 1,
            domain_dn: domain_dn.to_string(),
            csn,
        };
        self.store.put(
            IndexRecordCodec::encode_key(&record.change_number),
            IndexRecordCodec::encode_value(&record)?,
        )?;
        *last = record.change_number;
        Ok(record.change_number)
    }

    /// Last change number handed out, 0 when none ever was.
    pub fn last_generated_change_number(&self) -> i64 {
        *self.last_generated.lock()
    }

    /// Cursor starting at `from` (or the first record at or after it).
    pub fn new_cursor(&self, from: i64) -> Result<IndexCursor> {
        self.new_cursor_with(
            Some(from),
            KeyMatchingStrategy::GreaterThanOrEqualToKey,
            PositionStrategy::OnMatchingKey,
        )
    }

    /// Cursor with explicit strategies.
    pub fn new_cursor_with(
        &self,
        from: Option<i64>,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> Result<IndexCursor> {
        self.ensure_open()?;
        DbCursor::open(
            self.store.clone(),
            self.cursors.clone(),
            from,
            matching,
            position,
        )
    }

    fn decode(key: &[u8], value: &[u8]) -> Result<IndexRecord> {
        IndexRecordCodec::decode_value(IndexRecordCodec::decode_key(key)?, value)
    }

    /// Oldest record of the index.
    pub fn oldest_record(&self) -> Result<Option<IndexRecord>> {
        match self.store.first()? {
            Some((k, v)) => Ok(Some(Self::decode(&k, &v)?)),
            None => Ok(None),
        }
    }

    /// Newest record of the index.
    pub fn newest_record(&self) -> Result<Option<IndexRecord>> {
        match self.store.last()? {
            Some((k, v)) => Ok(Some(Self::decode(&k, &v)?)),
            None => Ok(None),
        }
    }

    /// Number of records.
    pub fn record_count(&self) -> Result<usize> {
        Ok(self.store.len()?)
    }

    /// Number of open cursors.
    pub fn open_cursor_count(&self) -> usize {
        self.cursors.open_count()
    }

    /// Visits records in change number order until `visit` returns false.
    fn scan(&self, mut visit: impl FnMut(&[u8], IndexRecord) -> bool) -> Result<()> {
        let mut after: Option<Vec<u8>> = None;
        loop {
            let bound = match &after {
                None => Bound::Unbounded,
                Some(k) => Bound::Excluded(k.as_slice()),
            };
            let Some((key, value)) = self.store.seek(bound)? else {
                return Ok(());
            };
            let record = Self::decode(&key, &value)?;
            if !visit(&key, record) {
                return Ok(());
            }
            after = Some(key);
        }
    }

    /// Removes leading records whose CSN is at or below `cutoff`.
    ///
    /// Stops at the first newer record, the newest record, or the oldest open
    /// cursor. Returns the oldest record left.
    pub fn purge_up_to(&self, cutoff: Csn) -> Result<Option<IndexRecord>> {
        let _last = self.last_generated.lock();
        self.ensure_open()?;
        let Some((newest_key, _)) = self.store.last()? else {
            return Ok(None);
        };
        let mut end: Option<Vec<u8>> = None;
        self.scan(|key, record| {
            if key >= newest_key.as_slice() || record.csn > cutoff {
                return false;
            }
            end = Some(key_successor(key));
            true
        })?;
        if let Some(limit) = end.and_then(|end| self.cursors.purge_limit(end)) {
            let removed = self.store.delete_range(&[], &limit)?;
            if removed > 0 {
                self.store.sync()?;
                debug!(removed, %cutoff, "purged change number index");
            }
        }
        self.oldest_record()
    }

    /// Drops the records of one domain, except the newest record of the index.
    pub fn remove_domain(&self, domain_dn: &str) -> Result<usize> {
        let _last = self.last_generated.lock();
        self.ensure_open()?;
        let Some((newest_key, _)) = self.store.last()? else {
            return Ok(0);
        };
        let mut ops = Vec::new();
        self.scan(|key, record| {
            if record.domain_dn == domain_dn && key != newest_key.as_slice() {
                ops.push(BatchOp::Delete { key: key.to_vec() });
            }
            true
        })?;
        let removed = ops.len();
        if removed > 0 {
            self.store.write_batch(ops)?;
            info!(domain = domain_dn, removed, "removed domain from change number index");
        }
        Ok(removed)
    }

    /// Removes every record and resets the counter. Fails while cursors are open.
    pub fn clear(&self) -> Result<()> {
        let mut last = self.last_generated.lock();
        let open = self.cursors.open_count();
        if open > 0 {
            return Err(ChangelogError::IllegalState(format!(
                "cannot clear change number index with {} open cursors",
                open
            )));
        }
        self.store.clear()?;
        *last = 0;
        info!("change number index cleared");
        Ok(())
    }

    /// Flushes to durable storage.
    pub fn flush(&self) -> Result<()> {
        Ok(self.store.sync()?)
    }

    /// Flushes and refuses further writes and cursors.
    pub fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _last = self.last_generated.lock();
            self.store.sync()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for ChangeNumberIndexDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeNumberIndexDb")
            .field("last_generated", &self.last_generated_change_number())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}
