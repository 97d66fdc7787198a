//! Heartbeats on idle replication sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::Clock;
use crate::csn::Csn;
use crate::error::ConfigError;
use crate::session::{ReplicationMsg, Session};
use crate::task::BackgroundTask;

/// Shortest heartbeat interval accepted.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Publishes a heartbeat on a session whenever it stayed silent for one interval.
///
/// One publisher per session. The loop ends on [`HeartbeatPublisher::shutdown`] or
/// on the first failed publish.
#[derive(Debug)]
pub struct HeartbeatPublisher {
    task: BackgroundTask,
    join_timeout: Duration,
}

impl HeartbeatPublisher {
    /// Starts publishing on `session`. Must run inside a tokio runtime.
    pub fn start(
        session: Arc<dyn Session>,
        local_replica_id: i16,
        interval: Duration,
        join_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        if interval < MIN_HEARTBEAT_INTERVAL {
            return Err(ConfigError::Invalid {
                field: "heartbeat_interval_ms",
                reason: format!("{} ms is below the 1 s minimum", interval.as_millis()),
            });
        }
        let task = BackgroundTask::spawn("heartbeat-publisher", move |token| {
            heartbeat_loop(session, local_replica_id, interval, clock, token)
        });
        Ok(Self { task, join_timeout })
    }

    /// False once the loop ended.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wakes the loop, then waits for it within the join timeout.
    pub async fn shutdown(self) -> bool {
        self.task.stop(self.join_timeout).await
    }
}

async fn heartbeat_loop(
    session: Arc<dyn Session>,
    replica_id: i16,
    interval: Duration,
    clock: Arc<dyn Clock>,
    token: CancellationToken,
) {
    let interval_ms = interval.as_millis() as i64;
    loop {
        let now = clock.now_millis();
        if now - session.last_publish_time() >= interval_ms {
            let csn = Csn::new(now, 0, replica_id);
            if let Err(e) = session.publish(ReplicationMsg::Heartbeat { csn }).await {
                warn!(replica_id, error = %e, "heartbeat publish failed, stopping publisher");
                return;
            }
            trace!(replica_id, %csn, "heartbeat sent");
        }
        let mut wait = session.last_publish_time() + interval_ms - clock.now_millis();
        if wait <= 0 {
            wait = interval_ms;
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(wait as u64)) => {}
        }
    }
    debug!(replica_id, "heartbeat publisher stopped");
}
