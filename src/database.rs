//! Database Module
//!
//! Owns the pieces shared by every store in a data directory.
//!
//! ## Responsibilities
//! - Create the data directory and the shared block cache
//! - Create, open, close and remove stores by name
//! - Hand out transactions from one pool

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::block::BlockManager;
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::store::BlockStore;
use crate::transaction::{Transaction, TransactionPool};

/// A directory of stores sharing one block cache
///
/// ## Concurrency:
/// - `stores`: name → open store, guarded by a mutex held only for map
///   changes, never across store I/O
/// - All methods use `&self`
pub struct Database {
    config: Config,
    manager: Arc<BlockManager>,
    pool: Arc<TransactionPool>,
    stores: Mutex<HashMap<String, Arc<BlockStore>>>,
}

impl Database {
    const STORE_EXTENSION: &'static str = "db";

    /// Open a database rooted at `config.data_dir`
    pub fn open(config: Config) -> Result<Self> {
        // Step 1: Reject unusable settings
        config.validate()?;

        // Step 2: Create the data directory if it doesn't exist
        fs::create_dir_all(&config.data_dir)?;

        // Step 3: Start the shared cache and its write-back thread
        let manager = Arc::new(BlockManager::new(&config)?);

        // Step 4: Transaction pool
        let pool = Arc::new(TransactionPool::new(
            config.transaction_pool_size,
            config.lock_timeout(),
        ));

        info!(
            data_dir = %config.data_dir.display(),
            cache_blocks = manager.capacity(),
            "database opened"
        );

        Ok(Self {
            config,
            manager,
            pool,
            stores: Mutex::new(HashMap::new()),
        })
    }

    /// Open a database in `path` with default settings
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(Config::builder().data_dir(path.as_ref()).build())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.manager
    }

    pub fn pool(&self) -> &Arc<TransactionPool> {
        &self.pool
    }

    /// File backing the store called `name`
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.config
            .data_dir
            .join(format!("{}.{}", name, Self::STORE_EXTENSION))
    }

    // =========================================================================
    // Stores
    // =========================================================================

    /// Create a new store file. Fails if the store is open or its file exists.
    pub fn create_store(&self, name: &str) -> Result<Arc<BlockStore>> {
        Self::check_name(name)?;
        let mut stores = self.stores.lock();
        if stores.contains_key(name) {
            return Err(StoreError::IllegalState(format!(
                "store {} is already open",
                name
            )));
        }

        let store = BlockStore::create(
            name,
            &self.store_path(name),
            Arc::clone(&self.manager),
            &self.config,
        )?;
        stores.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Open an existing store, or return it if already open
    pub fn open_store(&self, name: &str) -> Result<Arc<BlockStore>> {
        Self::check_name(name)?;
        let mut stores = self.stores.lock();
        if let Some(store) = stores.get(name) {
            return Ok(Arc::clone(store));
        }

        let store = BlockStore::open(
            name,
            &self.store_path(name),
            Arc::clone(&self.manager),
            &self.config,
        )?;
        stores.insert(name.to_string(), Arc::clone(&store));
        Ok(store)
    }

    /// Open the store if its file exists, otherwise create it
    pub fn open_or_create_store(&self, name: &str) -> Result<Arc<BlockStore>> {
        if self.store_path(name).exists() {
            self.open_store(name)
        } else {
            self.create_store(name)
        }
    }

    /// An already open store
    pub fn store(&self, name: &str) -> Option<Arc<BlockStore>> {
        self.stores.lock().get(name).cloned()
    }

    /// Names of the open stores, sorted
    pub fn store_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stores.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Close a store; returns false if it was not open
    pub fn close_store(&self, name: &str) -> Result<bool> {
        let store = self.stores.lock().remove(name);
        match store {
            Some(store) => store.close().map(|()| true),
            None => Ok(false),
        }
    }

    /// Close a store and delete its file
    pub fn remove_store(&self, name: &str) -> Result<()> {
        let store = self.stores.lock().remove(name);
        match store {
            Some(store) => store.remove(),
            None => {
                let path = self.store_path(name);
                fs::remove_file(&path)?;
                Ok(())
            }
        }
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    pub fn begin(&self) -> Transaction {
        self.pool.begin()
    }

    pub fn begin_auto_commit(&self) -> Transaction {
        self.pool.begin_auto_commit()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Close every open store and stop the write-back thread
    ///
    /// Every store is closed even if some fail; the first failure is returned.
    pub fn close(&self) -> Result<()> {
        let stores: Vec<Arc<BlockStore>> = self.stores.lock().drain().map(|(_, s)| s).collect();

        let mut first_error = None;
        for store in stores {
            if let Err(e) = store.close() {
                warn!(store = %store.name(), error = %e, "failed to close store");
                first_error.get_or_insert(e);
            }
        }

        self.manager.shutdown();
        info!(data_dir = %self.config.data_dir.display(), "database closed");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn check_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(StoreError::InvalidArgument(format!(
                "invalid store name {:?}",
                name
            )));
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let stores: Vec<Arc<BlockStore>> = self.stores.lock().drain().map(|(_, s)| s).collect();
        for store in stores {
            if let Err(e) = store.close() {
                warn!(store = %store.name(), error = %e, "failed to close store on drop");
            }
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("data_dir", &self.config.data_dir)
            .field("stores", &self.store_names())
            .finish()
    }
}
