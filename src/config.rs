//! Configuration for BlockVault
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, StoreError};
use crate::store::BLOCK_SIZE;

/// Smallest cache the block manager will run with (1 MB worth of blocks)
const MIN_CACHE_BYTES: usize = 1024 * 1024;

/// Main configuration for a BlockVault database
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all store files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── {store}.db
    ///     └── ...
    pub data_dir: PathBuf,

    /// Write dirty blocks and the allocation table when a transaction commits.
    /// When false, data only reaches disk through write-back or close.
    pub flush_dirty_blocks_on_commit: bool,

    /// Concurrent non-priority file operations allowed per store
    pub io_permits: usize,

    /// Open file handles kept for reuse per store
    pub file_handle_pool: usize,

    // -------------------------------------------------------------------------
    // Block Cache Configuration
    // -------------------------------------------------------------------------
    /// Memory budget for the shared block cache (in bytes)
    pub block_cache_bytes: usize,

    /// Bound of the dirty block write-back queue
    pub write_queue_capacity: usize,

    /// How long a producer waits on a full write-back queue (milliseconds)
    /// before writing the block itself
    pub write_queue_timeout_ms: u64,

    /// How long closing a store waits for its queued writes (milliseconds)
    pub free_store_timeout_ms: u64,

    // -------------------------------------------------------------------------
    // Locking / Transaction Configuration
    // -------------------------------------------------------------------------
    /// Block lock timeout for each I/O call (milliseconds)
    pub lock_timeout_ms: u64,

    /// Idle transactions kept for reuse
    pub transaction_pool_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./blockvault_data"),
            flush_dirty_blocks_on_commit: true,
            io_permits: 8,
            file_handle_pool: 4,
            block_cache_bytes: 64 * 1024 * 1024, // 64 MB
            write_queue_capacity: 256,
            write_queue_timeout_ms: 100,
            free_store_timeout_ms: 60_000,
            lock_timeout_ms: 120_000,
            transaction_pool_size: 32,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Number of blocks the shared cache holds
    pub fn cache_capacity_blocks(&self) -> usize {
        self.block_cache_bytes.max(MIN_CACHE_BYTES) / BLOCK_SIZE
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn free_store_timeout(&self) -> Duration {
        Duration::from_millis(self.free_store_timeout_ms)
    }

    pub fn write_queue_timeout(&self) -> Duration {
        Duration::from_millis(self.write_queue_timeout_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.io_permits == 0 {
            return Err(StoreError::Config("io_permits must be > 0".to_string()));
        }
        if self.write_queue_capacity == 0 {
            return Err(StoreError::Config(
                "write_queue_capacity must be > 0".to_string(),
            ));
        }
        if self.lock_timeout_ms == 0 {
            return Err(StoreError::Config("lock_timeout_ms must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all store files)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set whether commits write dirty blocks immediately
    pub fn flush_dirty_blocks_on_commit(mut self, flush: bool) -> Self {
        self.config.flush_dirty_blocks_on_commit = flush;
        self
    }

    /// Set the number of concurrent non-priority file operations per store
    pub fn io_permits(mut self, permits: usize) -> Self {
        self.config.io_permits = permits;
        self
    }

    /// Set the number of pooled file handles per store
    pub fn file_handle_pool(mut self, count: usize) -> Self {
        self.config.file_handle_pool = count;
        self
    }

    /// Set the block cache budget (in bytes)
    pub fn block_cache_bytes(mut self, bytes: usize) -> Self {
        self.config.block_cache_bytes = bytes;
        self
    }

    /// Set the write-back queue bound
    pub fn write_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.write_queue_capacity = capacity;
        self
    }

    /// Set the full-queue producer wait (in milliseconds)
    pub fn write_queue_timeout_ms(mut self, ms: u64) -> Self {
        self.config.write_queue_timeout_ms = ms;
        self
    }

    /// Set the store close drain timeout (in milliseconds)
    pub fn free_store_timeout_ms(mut self, ms: u64) -> Self {
        self.config.free_store_timeout_ms = ms;
        self
    }

    /// Set the block lock timeout (in milliseconds)
    pub fn lock_timeout_ms(mut self, ms: u64) -> Self {
        self.config.lock_timeout_ms = ms;
        self
    }

    /// Set the number of idle transactions kept for reuse
    pub fn transaction_pool_size(mut self, size: usize) -> Self {
        self.config.transaction_pool_size = size;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
