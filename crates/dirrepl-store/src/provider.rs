//! Named store providers.
//!
//! A provider hands out one physical store per log name (for example
//! `"1.dom/2.server"`). Opening the same name twice returns the same instance so a
//! single writer owns each WAL.

use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::info;

use crate::btree_store::PersistentKvStore;
use crate::error::{Result, StoreError};
use crate::kvstore::{KvStore, MemoryKvStore};

/// Opens and removes named stores.
pub trait StoreProvider: Send + Sync {
    /// Open the named store, creating it if missing.
    fn open(&self, name: &str) -> Result<Arc<dyn KvStore>>;

    /// Returns true when the named store has been created before.
    fn exists(&self, name: &str) -> Result<bool>;

    /// Delete the named store and all of its data.
    fn remove(&self, name: &str) -> Result<()>;

    /// Delete every store owned by this provider.
    fn remove_all(&self) -> Result<()>;
}

fn validate_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Provider of in-memory stores; contents live as long as the provider.
#[derive(Default)]
pub struct MemoryStoreProvider {
    stores: Mutex<HashMap<String, Arc<MemoryKvStore>>>,
}

impl MemoryStoreProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoreProvider for MemoryStoreProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn KvStore>> {
        validate_name(name)?;
        let mut stores = self.stores.lock().map_err(StoreError::poisoned)?;
        let store: Arc<dyn KvStore> = stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryKvStore::new()))
            .clone();
        Ok(store)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let stores = self.stores.lock().map_err(StoreError::poisoned)?;
        Ok(stores.contains_key(name))
    }

    fn remove(&self, name: &str) -> Result<()> {
        let mut stores = self.stores.lock().map_err(StoreError::poisoned)?;
        if let Some(store) = stores.remove(name) {
            store.clear()?;
        }
        Ok(())
    }

    fn remove_all(&self) -> Result<()> {
        let mut stores = self.stores.lock().map_err(StoreError::poisoned)?;
        for (_, store) in stores.drain() {
            store.clear()?;
        }
        Ok(())
    }
}

/// Provider of [`PersistentKvStore`]s laid out as subdirectories of a root.
pub struct PersistentStoreProvider {
    root: PathBuf,
    open: Mutex<HashMap<String, Arc<PersistentKvStore>>>,
}

impl PersistentStoreProvider {
    /// Creates a provider rooted at `root`; the directory is created on demand.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Root directory of all stores.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl StoreProvider for PersistentStoreProvider {
    fn open(&self, name: &str) -> Result<Arc<dyn KvStore>> {
        validate_name(name)?;
        let mut open = self.open.lock().map_err(StoreError::poisoned)?;
        if let Some(store) = open.get(name) {
            let store: Arc<dyn KvStore> = store.clone();
            return Ok(store);
        }
        let store = Arc::new(PersistentKvStore::open(&self.root.join(name))?);
        open.insert(name.to_string(), store.clone());
        let store: Arc<dyn KvStore> = store;
        Ok(store)
    }

    fn exists(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        Ok(self.root.join(name).is_dir())
    }

    fn remove(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut open = self.open.lock().map_err(StoreError::poisoned)?;
        open.remove(name);
        let dir = self.root.join(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn remove_all(&self) -> Result<()> {
        let mut open = self.open.lock().map_err(StoreError::poisoned)?;
        open.clear();
        if self.root.exists() {
            info!(root = %self.root.display(), "removing all stores");
            fs::remove_dir_all(&self.root)?;
        }
        Ok(())
    }
}
