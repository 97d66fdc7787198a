#![warn(missing_docs)]

//! dirrepl store subsystem: an ordered, byte-keyed key-value store used as the
//! physical layer of every changelog log.
//!
//! Keys sort by plain byte-lexicographic comparison. Callers that need a numeric
//! order must encode their keys so that the byte order matches it.

pub mod btree_store;
pub mod error;
pub mod kvstore;
pub mod provider;

pub use btree_store::PersistentKvStore;
pub use error::{Result, StoreError};
pub use kvstore::{key_successor, BatchOp, Key, KvPair, KvStore, MemoryKvStore, Value};
pub use provider::{MemoryStoreProvider, PersistentStoreProvider, StoreProvider};
