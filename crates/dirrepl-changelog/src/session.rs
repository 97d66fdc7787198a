//! Replication sessions between peers.
//!
//! This module defines the [`Session`] trait the changelog talks to peers through,
//! the messages exchanged, and [`ChannelSession`], an in-process implementation
//! over tokio channels.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use crate::clock::Clock;
use crate::csn::Csn;
use crate::error::TransportError;
use crate::record::ChangeRecord;

/// Message exchanged over a replication session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationMsg {
    /// A logged change.
    Update(ChangeRecord),
    /// Liveness signal sent on an idle session.
    Heartbeat {
        /// `CSN(now, 0, sender replica id)`.
        csn: Csn,
    },
    /// The sending replica is going offline for a domain.
    ReplicaOffline {
        /// Domain being left.
        domain_dn: String,
        /// CSN stamped by the leaving replica.
        csn: Csn,
    },
}

/// A bidirectional replication session with one peer.
///
/// Implementations must be safe to share between the task that forwards changes
/// and the heartbeat publisher.
#[async_trait]
pub trait Session: Send + Sync {
    /// Send a message to the peer.
    ///
    /// # Arguments
    /// * `msg` - The message to send.
    ///
    /// Successful publishes update [`Session::last_publish_time`].
    async fn publish(&self, msg: ReplicationMsg) -> Result<(), TransportError>;

    /// Receive the next message from the peer.
    ///
    /// # Returns
    /// The message, or `TransportError::Closed` once the peer is gone.
    async fn receive(&self) -> Result<ReplicationMsg, TransportError>;

    /// Wall time of the last successful publish, in milliseconds.
    fn last_publish_time(&self) -> i64;
}

/// One end of an in-process session pair.
pub struct ChannelSession {
    tx: mpsc::Sender<ReplicationMsg>,
    rx: Mutex<mpsc::Receiver<ReplicationMsg>>,
    last_publish: AtomicI64,
    clock: Arc<dyn Clock>,
}

impl ChannelSession {
    /// Creates two connected ends, each buffering up to `capacity` messages.
    ///
    /// The last publish time of both ends starts at the current clock reading.
    pub fn pair(clock: Arc<dyn Clock>, capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        let now = clock.now_millis();
        let a = Self {
            tx: a_tx,
            rx: Mutex::new(a_rx),
            last_publish: AtomicI64::new(now),
            clock: clock.clone(),
        };
        let b = Self {
            tx: b_tx,
            rx: Mutex::new(b_rx),
            last_publish: AtomicI64::new(now),
            clock,
        };
        (a, b)
    }

    /// Takes an already delivered message without waiting.
    pub fn try_receive(&self) -> Option<ReplicationMsg> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl Session for ChannelSession {
    async fn publish(&self, msg: ReplicationMsg) -> Result<(), TransportError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| TransportError::Closed)?;
        self.last_publish
            .store(self.clock.now_millis(), Ordering::Release);
        Ok(())
    }

    async fn receive(&self) -> Result<ReplicationMsg, TransportError> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::Closed)
    }

    fn last_publish_time(&self) -> i64 {
        self.last_publish.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ChannelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSession")
            .field("last_publish", &self.last_publish_time())
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_pair_delivers_both_ways() {
        let clock = Arc::new(ManualClock::new(100));
        let (a, b) = ChannelSession::pair(clock.clone(), 4);
        let hb = ReplicationMsg::Heartbeat {
            csn: Csn::new(100, 0, 1),
        };
        a.publish(hb.clone()).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), hb);

        clock.set(250);
        b.publish(hb.clone()).await.unwrap();
        assert_eq!(a.try_receive(), Some(hb));
        assert_eq!(b.last_publish_time(), 250);
        assert_eq!(a.last_publish_time(), 100);
    }

    #[tokio::test]
    async fn test_publish_to_dropped_peer_fails() {
        let clock = Arc::new(ManualClock::new(0));
        let (a, b) = ChannelSession::pair(clock, 1);
        drop(b);
        let err = a
            .publish(ReplicationMsg::Heartbeat {
                csn: Csn::new(0, 0, 1),
            })
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
        assert!(matches!(a.receive().await, Err(TransportError::Closed)));
    }
}
