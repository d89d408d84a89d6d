//! Block Manager
//!
//! Process-wide LRU cache of blocks, shared by every open store.
//!
//! ## Responsibilities
//! - Hand out counted `BlockHandle`s keyed by block id
//! - Evict least recently used blocks nobody is holding
//! - Queue dirty evicted blocks for the background writer
//! - Serve cache misses from the write-back queue before disk
//! - Drain a store's blocks when it closes
//! - Allocate store ids

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::store::StoreIo;

use super::writer::{spawn_writer, write_back, PendingWrites};
use super::{block_id_to_store_id, Block, BlockHandle, StoreIdAllocator};

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub capacity: usize,
    pub cached_blocks: usize,
    pub pending_writes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    /// Dirty blocks handed to the background writer
    pub queued_writes: u64,
    /// Dirty blocks written by the releasing thread because the queue was full
    pub inline_writes: u64,
}

/// Cached blocks, most recently used first
///
/// Unbounded: pinned blocks may push it past `capacity`, and `get_block`
/// trims it back when they are released.
type BlockCache = LruCache<u64, Arc<Block>>;

/// Least recently used block held only by the cache
fn victim(cache: &BlockCache) -> Option<u64> {
    cache
        .iter()
        .rev()
        .find(|(_, block)| block.use_count() == 1)
        .map(|(id, _)| *id)
}

/// State reachable from every `BlockHandle`
///
/// The writer thread only sees `pending` and the channel receiver, so
/// dropping the manager can stop it.
pub(crate) struct ManagerShared {
    cache: Mutex<BlockCache>,
    capacity: usize,
    pending: Arc<PendingWrites>,
    sender: Mutex<Option<Sender<Arc<Block>>>>,
    queue_timeout: Duration,

    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    queued_writes: AtomicU64,
    inline_writes: AtomicU64,
}

impl ManagerShared {
    /// Handle a block whose last reference was dropped outside the cache
    pub(crate) fn release(&self, block: Arc<Block>) {
        let queued = {
            let _cache = self.cache.lock();
            self.retire(block)
        };
        if let Some(block) = queued {
            self.dispatch(block);
        }
    }

    /// Retire a block nobody references. Call with `cache` held.
    ///
    /// A dirty block enters `pending` before the cache lock is released, so
    /// a miss on its id takes over the newest buffer instead of reading
    /// disk. Returns the block if it still has to be written.
    fn retire(&self, block: Arc<Block>) -> Option<Arc<Block>> {
        if block.is_dirty() {
            self.pending.insert(Arc::clone(&block));
            Some(block)
        } else {
            block.mark_freed();
            None
        }
    }

    /// Hand a pending block to the writer thread
    fn dispatch(&self, block: Arc<Block>) {
        let sender = self.sender.lock().clone();
        let block = match sender {
            Some(tx) => match tx.send_timeout(block, self.queue_timeout) {
                Ok(()) => {
                    self.queued_writes.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => e.into_inner(),
            },
            None => block,
        };

        // queue full or writer stopped
        self.inline_writes.fetch_add(1, Ordering::Relaxed);
        write_back(&self.pending, &block);
    }
}

/// Process-wide block cache
///
/// ## Concurrency:
/// - `cache`: one mutex over the LRU map; held for lookups, eviction choice
///   and the hand-off of dirty victims into `pending`, never across disk I/O
///   except the pending-buffer copy on a miss
/// - released blocks are handed to the writer thread through a bounded
///   crossbeam channel
/// - All methods use `&self`
pub struct BlockManager {
    shared: Arc<ManagerShared>,
    store_ids: StoreIdAllocator,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl BlockManager {
    /// Create a manager sized from `config` and start its writer thread
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        Self::with_capacity(
            config.cache_capacity_blocks(),
            config.write_queue_capacity,
            config.write_queue_timeout(),
        )
    }

    /// Create a manager holding at most `capacity` unpinned blocks
    pub fn with_capacity(
        capacity: usize,
        queue_capacity: usize,
        queue_timeout: Duration,
    ) -> Result<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = channel::bounded(queue_capacity.max(1));
        let pending = Arc::new(PendingWrites::default());
        let writer = spawn_writer(rx, Arc::clone(&pending))?;

        debug!(capacity, queue_capacity, "block manager started");

        Ok(Self {
            shared: Arc::new(ManagerShared {
                cache: Mutex::new(LruCache::unbounded()),
                capacity,
                pending,
                sender: Mutex::new(Some(tx)),
                queue_timeout,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                queued_writes: AtomicU64::new(0),
                inline_writes: AtomicU64::new(0),
            }),
            store_ids: StoreIdAllocator::new(),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    // =========================================================================
    // Store Ids
    // =========================================================================

    pub fn allocate_store_id(&self) -> Result<u64> {
        self.store_ids.allocate()
    }

    pub fn free_store_id(&self, id: u64) {
        self.store_ids.free(id);
    }

    // =========================================================================
    // Block Lookup
    // =========================================================================

    /// Get the cached block for `block_id`, creating it on a miss
    ///
    /// A new block starts invalid unless the id was still waiting for
    /// write-back, in which case it takes over that buffer and dirty range.
    pub fn get_block(&self, io: &Arc<StoreIo>, block_id: u64) -> Result<BlockHandle> {
        if block_id_to_store_id(block_id) != io.store_id() {
            return Err(StoreError::InvalidArgument(format!(
                "{}: block id 0x{:x} does not belong to store {}",
                io.name(),
                block_id,
                io.store_id()
            )));
        }

        let shared = &self.shared;
        let mut queued = Vec::new();
        let block = {
            let mut cache = shared.cache.lock();

            if let Some(cached) = cache.get(&block_id) {
                let block = Arc::clone(cached);
                block.allocate();
                shared.hits.fetch_add(1, Ordering::Relaxed);
                block
            } else {
                shared.misses.fetch_add(1, Ordering::Relaxed);

                let block = Arc::new(Block::new(block_id, Arc::clone(io)));
                if let Some(pending) = shared.pending.get(io, block_id) {
                    pending.copy_to_block(&block);
                }

                // one reference for the cache, one for the caller
                block.allocate();
                block.allocate();
                cache.put(block_id, Arc::clone(&block));

                while cache.len() > shared.capacity {
                    let Some(id) = victim(&cache) else { break };
                    let Some(evicted) = cache.pop(&id) else { break };
                    shared.evictions.fetch_add(1, Ordering::Relaxed);

                    // only the cache held it, so this is the last reference
                    if evicted.free_ref() {
                        queued.extend(shared.retire(evicted));
                    }
                }
                block
            }
        };

        for block in queued {
            shared.dispatch(block);
        }

        Ok(BlockHandle::new(block, Arc::clone(&self.shared)))
    }

    /// Get a block and make sure its buffer has been read
    pub fn read_block(&self, io: &Arc<StoreIo>, block_id: u64) -> Result<BlockHandle> {
        let block = self.get_block(io, block_id)?;
        block.read()?;
        Ok(block)
    }

    pub fn is_cached(&self, block_id: u64) -> bool {
        self.shared.cache.lock().contains(&block_id)
    }

    // =========================================================================
    // Store Teardown
    // =========================================================================

    /// Write every dirty cached block of a store
    pub fn flush(&self, store_id: u64) -> Result<()> {
        for block in self.store_blocks(store_id) {
            block.write()?;
        }
        Ok(())
    }

    /// Evict every cached block of a store and wait for its queued writes
    ///
    /// Returns false if writes were still pending when `timeout` elapsed.
    pub fn free_store(&self, store_id: u64, timeout: Duration) -> bool {
        let shared = &self.shared;
        let removed: Vec<(Arc<Block>, bool)> = {
            let mut cache = shared.cache.lock();
            let ids: Vec<u64> = cache
                .iter()
                .map(|(id, _)| *id)
                .filter(|id| block_id_to_store_id(*id) == store_id)
                .collect();

            ids.into_iter()
                .filter_map(|id| cache.pop(&id))
                .map(|block| {
                    let dirty = block.is_dirty();
                    if dirty {
                        shared.pending.insert(Arc::clone(&block));
                    }
                    (block, dirty)
                })
                .collect()
        };

        for (block, dirty) in removed {
            if let Err(e) = block.write() {
                warn!(
                    store = %block.store_name(),
                    block = block.id(),
                    error = %e,
                    "failed to write block while freeing store"
                );
            }
            if dirty {
                shared.pending.complete(&block);
            }
            if block.free_ref() {
                shared.release(block);
            }
        }

        let drained = self.shared.pending.wait_for_store(store_id, timeout);
        if !drained {
            warn!(
                store_id,
                pending = self.shared.pending.count_for_store(store_id),
                timeout_ms = timeout.as_millis() as u64,
                "timed out waiting for store writes to drain"
            );
        }
        drained
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn stats(&self) -> ManagerStats {
        let shared = &self.shared;
        ManagerStats {
            capacity: shared.capacity,
            cached_blocks: shared.cache.lock().len(),
            pending_writes: shared.pending.len(),
            hits: shared.hits.load(Ordering::Relaxed),
            misses: shared.misses.load(Ordering::Relaxed),
            evictions: shared.evictions.load(Ordering::Relaxed),
            queued_writes: shared.queued_writes.load(Ordering::Relaxed),
            inline_writes: shared.inline_writes.load(Ordering::Relaxed),
        }
    }

    /// Stop the writer thread after it drains the queue
    ///
    /// Blocks released afterwards are written by the releasing thread.
    pub fn shutdown(&self) {
        let sender = self.shared.sender.lock().take();
        drop(sender);

        if let Some(writer) = self.writer.lock().take() {
            if writer.join().is_err() {
                warn!("block writer thread panicked");
            }
            debug!("block manager stopped");
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn store_blocks(&self, store_id: u64) -> Vec<Arc<Block>> {
        self.shared
            .cache
            .lock()
            .iter()
            .filter(|(_, block)| block.store_id() == store_id)
            .map(|(_, block)| Arc::clone(block))
            .collect()
    }
}

impl Drop for BlockManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for BlockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockManager")
            .field("stats", &self.stats())
            .finish()
    }
}
