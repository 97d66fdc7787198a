//! Shared fixtures for changelog integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use dirrepl_changelog::{ChangeRecord, ChangelogConfig, ChangelogDb, Csn, ManualClock, Operation};
use dirrepl_store::{MemoryStoreProvider, PersistentStoreProvider};

pub const DOMAIN: &str = "dc=example,dc=com";
pub const OTHER_DOMAIN: &str = "o=other";

/// Config with slow background loops so tests drive purge and indexing by hand.
pub fn test_config(db_dir: &Path) -> ChangelogConfig {
    ChangelogConfig {
        db_dir: db_dir.to_path_buf(),
        purge_interval_ms: 3_600_000,
        task_join_timeout_ms: 1_000,
        ..ChangelogConfig::default()
    }
}

pub fn memory_changelog(clock: Arc<ManualClock>) -> Arc<ChangelogDb> {
    let config = test_config(Path::new("unused"));
    let db = Arc::new(ChangelogDb::new(
        &config,
        Arc::new(MemoryStoreProvider::new()),
        clock,
    ));
    db.initialize_db().unwrap();
    db
}

pub fn persistent_changelog(dir: &Path, clock: Arc<ManualClock>) -> Arc<ChangelogDb> {
    let config = test_config(dir);
    let db = Arc::new(ChangelogDb::new(
        &config,
        Arc::new(PersistentStoreProvider::new(dir)),
        clock,
    ));
    db.initialize_db().unwrap();
    db
}

pub fn add(dn: &str) -> Operation {
    Operation::Add {
        dn: dn.to_string(),
        entry: b"objectClass: person".to_vec(),
    }
}

pub fn record(domain_dn: &str, timestamp: i64, seqnum: u16, replica_id: i16) -> ChangeRecord {
    ChangeRecord::new(
        Csn::new(timestamp, seqnum, replica_id),
        domain_dn,
        add(&format!("cn=user{}-{},{}", timestamp, seqnum, domain_dn)),
    )
}
