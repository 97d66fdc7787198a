//! Positionable forward cursors over a log.
//!
//! A [`DbCursor`] is opened at a key with a [`KeyMatchingStrategy`] and a
//! [`PositionStrategy`], then walked with [`DbCursor::next`]. Every open cursor
//! registers its position in the owning log's [`CursorRegistry`] so purging never
//! removes a record a reader can still reach.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dirrepl_store::KvStore;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::Result;
use crate::record::RecordCodec;

/// How the start key of a cursor is matched against the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyMatchingStrategy {
    /// Only the exact key; a cursor on a missing key is empty.
    EqualToKey,
    /// The first key at or after the start key.
    GreaterThanOrEqualToKey,
    /// The last key at or before the start key.
    LessThanOrEqualToKey,
}

/// Whether the first `next()` yields the matched record or the one after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PositionStrategy {
    /// Yield the matched record first.
    OnMatchingKey,
    /// Skip the matched record.
    AfterMatchingKey,
}

/// Lowest key a cursor may still read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CursorFloor {
    /// The cursor may read from the start of the log.
    Start,
    /// The cursor reads nothing below this key.
    Key(Vec<u8>),
}

/// Positions of the open cursors of one log.
#[derive(Debug, Default)]
pub(crate) struct CursorRegistry {
    next_id: AtomicU64,
    floors: Mutex<HashMap<u64, Option<CursorFloor>>>,
}

impl CursorRegistry {
    pub(crate) fn register(&self, floor: Option<CursorFloor>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.floors.lock().insert(id, floor);
        id
    }

    pub(crate) fn move_to(&self, id: u64, floor: Option<CursorFloor>) {
        if let Some(slot) = self.floors.lock().get_mut(&id) {
            *slot = floor;
        }
    }

    pub(crate) fn unregister(&self, id: u64) {
        self.floors.lock().remove(&id);
    }

    pub(crate) fn open_count(&self) -> usize {
        self.floors.lock().len()
    }

    /// Exclusive upper bound for a purge ending at `end`, or `None` when an open
    /// cursor pins the start of the log.
    pub(crate) fn purge_limit(&self, end: Vec<u8>) -> Option<Vec<u8>> {
        let floors = self.floors.lock();
        let mut limit = end;
        for floor in floors.values().flatten() {
            match floor {
                CursorFloor::Start => return None,
                CursorFloor::Key(key) if *key < limit => limit = key.clone(),
                CursorFloor::Key(_) => {}
            }
        }
        Some(limit)
    }
}

fn floor_of(bound: &Bound<Vec<u8>>) -> CursorFloor {
    match bound {
        Bound::Unbounded => CursorFloor::Start,
        Bound::Included(k) | Bound::Excluded(k) => CursorFloor::Key(k.clone()),
    }
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Unbounded => Bound::Unbounded,
        Bound::Included(k) => Bound::Included(k.as_slice()),
        Bound::Excluded(k) => Bound::Excluded(k.as_slice()),
    }
}

/// Forward-only cursor over the records of one log.
///
/// `record()` is `None` before the first `next()` and after a `next()` that
/// returned false. An exhausted cursor stays usable: a later `next()` picks up
/// records appended since. Dropping the cursor closes it.
pub struct DbCursor<C: RecordCodec> {
    store: Arc<dyn KvStore>,
    registry: Arc<CursorRegistry>,
    id: u64,
    next_from: Bound<Vec<u8>>,
    current: Option<C::Record>,
    empty: bool,
    closed: bool,
    _codec: PhantomData<C>,
}

impl<C: RecordCodec> DbCursor<C> {
    /// Opens a cursor positioned per `matching` and `position`.
    ///
    /// A `None` start reads from the first record whatever the strategies.
    pub(crate) fn open(
        store: Arc<dyn KvStore>,
        registry: Arc<CursorRegistry>,
        start: Option<C::Key>,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> Result<Self> {
        let id = registry.register(Some(CursorFloor::Start));
        let mut cursor = Self {
            store,
            registry,
            id,
            next_from: Bound::Unbounded,
            current: None,
            empty: false,
            closed: false,
            _codec: PhantomData,
        };
        if let Some(key) = start {
            cursor.position(C::encode_key(&key), matching, position)?;
        }
        let floor = if cursor.empty {
            None
        } else {
            Some(floor_of(&cursor.next_from))
        };
        cursor.registry.move_to(cursor.id, floor);
        Ok(cursor)
    }

    fn position(
        &mut self,
        key: Vec<u8>,
        matching: KeyMatchingStrategy,
        position: PositionStrategy,
    ) -> Result<()> {
        let matched = match matching {
            KeyMatchingStrategy::EqualToKey => {
                if self.store.contains_key(&key)? {
                    Some(key)
                } else {
                    self.empty = true;
                    return Ok(());
                }
            }
            KeyMatchingStrategy::GreaterThanOrEqualToKey => self
                .store
                .seek(Bound::Included(key.as_slice()))?
                .map(|(k, _)| k)
                .or(Some(key)),
            KeyMatchingStrategy::LessThanOrEqualToKey => self
                .store
                .seek_back(Bound::Included(key.as_slice()))?
                .map(|(k, _)| k),
        };
        self.next_from = match (matched, position) {
            (None, _) => Bound::Unbounded,
            (Some(k), PositionStrategy::OnMatchingKey) => Bound::Included(k),
            (Some(k), PositionStrategy::AfterMatchingKey) => Bound::Excluded(k),
        };
        Ok(())
    }

    /// The record under the cursor.
    pub fn record(&self) -> Option<&C::Record> {
        self.current.as_ref()
    }

    /// Moves to the next record. Returns false when none is left.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<bool> {
        if self.closed || self.empty {
            self.current = None;
            return Ok(false);
        }
        match self.store.seek(as_slice_bound(&self.next_from))? {
            Some((key, value)) => {
                let decoded = C::decode_key(&key)?;
                self.current = Some(C::decode_value(decoded, &value)?);
                self.registry
                    .move_to(self.id, Some(CursorFloor::Key(key.clone())));
                self.next_from = Bound::Excluded(key);
                Ok(true)
            }
            None => {
                self.current = None;
                Ok(false)
            }
        }
    }

    /// Reads every remaining record.
    pub fn drain(&mut self) -> Result<Vec<C::Record>> {
        let mut records = Vec::new();
        while self.next()? {
            if let Some(record) = self.current.clone() {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Releases the cursor. Idempotent.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.current = None;
            self.registry.unregister(self.id);
            trace!(cursor = self.id, "cursor closed");
        }
    }

    /// True once `close()` ran.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl<C: RecordCodec> Drop for DbCursor<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: RecordCodec> fmt::Debug for DbCursor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbCursor")
            .field("id", &self.id)
            .field("current", &self.current)
            .field("empty", &self.empty)
            .field("closed", &self.closed)
            .finish()
    }
}
