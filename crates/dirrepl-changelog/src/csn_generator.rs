//! Strictly increasing CSNs for the local replica.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::csn::Csn;
use crate::server_state::ServerState;

#[derive(Debug, Clone, Copy)]
struct LastIssued {
    timestamp: i64,
    seqnum: u16,
}

/// Generates CSNs for one replica.
///
/// Every CSN returned by [`CsnGenerator::next`] is strictly greater than every CSN
/// returned before it and than every CSN passed to [`CsnGenerator::adjust`]. The
/// timestamp is the clock reading unless the clock stalls or runs backwards, in which
/// case the sequence number carries the order.
#[derive(Debug)]
pub struct CsnGenerator {
    replica_id: i16,
    clock: Arc<dyn Clock>,
    last: Mutex<LastIssued>,
}

impl CsnGenerator {
    /// Creates a generator that has issued nothing yet.
    pub fn new(replica_id: i16, clock: Arc<dyn Clock>) -> Self {
        Self {
            replica_id,
            clock,
            last: Mutex::new(LastIssued {
                timestamp: i64::MIN,
                seqnum: 0,
            }),
        }
    }

    /// Creates a generator already adjusted past every CSN in `state`.
    pub fn with_state(replica_id: i16, clock: Arc<dyn Clock>, state: &ServerState) -> Self {
        let generator = Self::new(replica_id, clock);
        for csn in state.snapshot().into_values() {
            generator.adjust(csn);
        }
        generator
    }

    /// Replica id stamped on every CSN.
    pub fn replica_id(&self) -> i16 {
        self.replica_id
    }

    /// Issues the next CSN.
    pub fn next(&self) -> Csn {
        let now = self.clock.now_millis();
        let mut last = self.last.lock();
        if now > last.timestamp {
            last.timestamp = now;
            last.seqnum = 0;
        } else if last.seqnum == u16::MAX {
            last.timestamp += 1;
            last.seqnum = 0;
        } else {
            last.seqnum += 1;
        }
        Csn::new(last.timestamp, last.seqnum, self.replica_id)
    }

    /// Moves the generator past `csn`, typically one received from another replica.
    pub fn adjust(&self, csn: Csn) {
        let mut last = self.last.lock();
        if (csn.timestamp(), csn.seqnum()) > (last.timestamp, last.seqnum) {
            debug!(replica_id = self.replica_id, %csn, "adjusting CSN generator");
            last.timestamp = csn.timestamp();
            last.seqnum = csn.seqnum();
        }
    }
}
