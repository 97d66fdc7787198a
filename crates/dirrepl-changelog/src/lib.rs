#![warn(missing_docs)]

//! dirrepl replication changelog: CSNs, server states, per-replica change logs, the
//! change number index, cursors, purge, heartbeats and shutdown coordination.

pub mod changelog_db;
pub mod clock;
pub mod cn_index_db;
pub mod config;
pub mod csn;
pub mod csn_generator;
pub mod cursor;
mod domain_registry;
pub mod error;
pub mod heartbeat;
mod indexer;
pub mod publish;
pub mod purge;
pub mod record;
pub mod replica_db;
pub mod server_state;
pub mod session;
pub mod shutdown_sync;
mod task;

pub use changelog_db::{ChangelogDb, DbState};
pub use clock::{Clock, ManualClock, MonotonicClock, SystemClock};
pub use cn_index_db::{ChangeNumberIndexDb, IndexCursor};
pub use config::ChangelogConfig;
pub use csn::Csn;
pub use csn_generator::CsnGenerator;
pub use cursor::{DbCursor, KeyMatchingStrategy, PositionStrategy};
pub use error::{ChangelogError, ConfigError, Result, TransportError};
pub use heartbeat::HeartbeatPublisher;
pub use publish::ReplicationService;
pub use purge::PurgeReport;
pub use record::{ChangeRecord, IndexRecord, Operation, RecordCodec};
pub use replica_db::{ReplicaCursor, ReplicaDb};
pub use server_state::{MultiDomainServerState, ServerState};
pub use session::{ChannelSession, ReplicationMsg, Session};
pub use shutdown_sync::ShutdownSync;
