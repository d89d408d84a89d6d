//! Block Store
//!
//! Owns one store file: its allocation table, the block / fragment /
//! mini-fragment allocators and the I/O primitives layered on the shared
//! block cache.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::block::{
    block_id_to_index, block_index_to_address, block_index_to_id, BlockHandle, BlockManager,
    BLOCK_SIZE, STORE_ID_MASK,
};
use crate::config::Config;
use crate::error::{Result, StoreError};
use crate::lock::Lock;

use super::{
    AllocError, AllocType, AllocationTable, StoreHeader, StoreIo, ALLOC_BYTES_PER_BLOCK,
    ALLOC_GROUP_COUNT, ALLOC_GROUP_SIZE, FRAGMENT_SIZE, HEADER_BLOCK_INDEX, MINI_FRAG_BATCH,
    MINI_FRAG_BATCH_THRESHOLD, MINI_FRAG_SIZE,
};

/// Store lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed; file not yet laid out or loaded
    New,
    /// Accepting operations
    Active,
    /// Closed; every operation fails
    Closed,
}

/// Usage snapshot of a store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounters {
    pub block_count: u64,
    pub file_size: u64,
    pub free_blocks: u64,
    pub row_blocks: u64,
    pub used_blocks: u64,
    pub fragment_blocks: u64,
    pub index_blocks: u64,
    pub mini_fragment_blocks: u64,
    pub fragments_in_use: u64,
    pub mini_fragments_in_use: u64,
    /// Bytes held by live fragments
    pub fragment_bytes: u64,
    pub blocks_read: u64,
    pub blocks_written: u64,
}

/// Addressable unit of the I/O primitives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Block,
    Fragment,
    MiniFragment,
}

impl Unit {
    fn size(self) -> usize {
        match self {
            Unit::Block => BLOCK_SIZE,
            Unit::Fragment => FRAGMENT_SIZE,
            Unit::MiniFragment => MINI_FRAG_SIZE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Unit::Block => "block",
            Unit::Fragment => "fragment",
            Unit::MiniFragment => "mini-fragment",
        }
    }
}

/// Decrements the concurrent allocation-save count on drop
struct SaveTicket<'a> {
    count: &'a AtomicUsize,
    position: usize,
}

impl<'a> SaveTicket<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        let position = count.fetch_add(1, Ordering::SeqCst) + 1;
        Self { count, position }
    }
}

impl Drop for SaveTicket<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One store file and its allocators
///
/// ## Concurrency:
/// - `alloc`: the allocation lock; every table read and change goes through it
/// - `alloc_write_lock`: serializes table writes to disk, separate from
///   `alloc` so allocations continue while the table is written
/// - block contents are guarded by each block's own `Lock`
/// - All methods use `&self`
pub struct BlockStore {
    name: String,
    id: u64,
    io: Arc<StoreIo>,
    manager: Arc<BlockManager>,

    /// Lock for the rows of this store, taken by transactions
    row_lock: Arc<Lock>,

    lifecycle: Mutex<Lifecycle>,

    alloc: Mutex<AllocationTable>,
    alloc_write_lock: Mutex<()>,
    alloc_write_count: AtomicUsize,

    corrupted: AtomicBool,
    lock_timeout: Duration,
    free_store_timeout: Duration,
}

impl BlockStore {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Create a new store file at `path`
    ///
    /// Writes the allocation table (block 0) and the header (block 1). Fails
    /// with `IllegalState` if the file already exists.
    pub fn create(
        name: &str,
        path: &Path,
        manager: Arc<BlockManager>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let id = manager.allocate_store_id()?;
        let io = match StoreIo::create(name, path, id, config) {
            Ok(io) => Arc::new(io),
            Err(e) => {
                manager.free_store_id(id);
                return Err(e);
            }
        };

        let store = Arc::new(Self::new(name, id, io, manager, config));
        if let Err(e) = store.create_layout() {
            store.abort();
            return Err(e);
        }

        debug!(store = name, id, path = %path.display(), "created store");
        Ok(store)
    }

    /// Open an existing store file and load its allocation table
    pub fn open(
        name: &str,
        path: &Path,
        manager: Arc<BlockManager>,
        config: &Config,
    ) -> Result<Arc<Self>> {
        let id = manager.allocate_store_id()?;
        let io = match StoreIo::open(name, path, id, config) {
            Ok(io) => Arc::new(io),
            Err(e) => {
                manager.free_store_id(id);
                return Err(e);
            }
        };

        let store = Arc::new(Self::new(name, id, io, manager, config));
        if let Err(e) = store.init() {
            store.abort();
            return Err(e);
        }

        debug!(
            store = name,
            id,
            blocks = store.block_count(),
            "opened store"
        );
        Ok(store)
    }

    fn new(
        name: &str,
        id: u64,
        io: Arc<StoreIo>,
        manager: Arc<BlockManager>,
        config: &Config,
    ) -> Self {
        Self {
            name: name.to_string(),
            id,
            io,
            manager,
            row_lock: Arc::new(Lock::new(format!("row-lock:{}:{}", name, id))),
            lifecycle: Mutex::new(Lifecycle::New),
            alloc: Mutex::new(AllocationTable::new()),
            alloc_write_lock: Mutex::new(()),
            alloc_write_count: AtomicUsize::new(0),
            corrupted: AtomicBool::new(false),
            lock_timeout: config.lock_timeout(),
            free_store_timeout: config.free_store_timeout(),
        }
    }

    /// Lay out a fresh file: table block and header block
    fn create_layout(&self) -> Result<()> {
        {
            let mut table = self.alloc.lock();
            table.grow(HEADER_BLOCK_INDEX + 1);
            table
                .set(HEADER_BLOCK_INDEX, AllocType::Used)
                .map_err(|e| self.alloc_error(e))?;
        }

        self.io.write_at(0, &[0u8; BLOCK_SIZE], true)?;
        let header = StoreHeader::current().encode()?;
        self.io
            .write_at(block_index_to_address(HEADER_BLOCK_INDEX), &header, true)?;

        self.write_allocation()?;
        *self.lifecycle.lock() = Lifecycle::Active;
        Ok(())
    }

    /// Load an existing file: verify the header and read the table groups
    fn init(&self) -> Result<()> {
        let file_size = self.io.file_size();
        if file_size < 2 * BLOCK_SIZE as u64 {
            return Err(StoreError::Format(format!(
                "{}: file of {} bytes is too small for a store",
                self.name, file_size
            )));
        }
        if file_size % BLOCK_SIZE as u64 != 0 {
            warn!(
                store = %self.name,
                file_size,
                "store file is not a whole number of blocks"
            );
        }

        let mut header = vec![0u8; BLOCK_SIZE];
        self.io
            .read_at(block_index_to_address(HEADER_BLOCK_INDEX), &mut header)?;
        StoreHeader::decode(&self.name, &header)?;

        let block_count = file_size / BLOCK_SIZE as u64;
        let mut bytes = Vec::with_capacity(block_count as usize * ALLOC_BYTES_PER_BLOCK);
        let mut chunk = vec![0u8; BLOCK_SIZE];
        let mut group = 0u64;
        while group * ALLOC_GROUP_COUNT < block_count {
            let entries = (block_count - group * ALLOC_GROUP_COUNT).min(ALLOC_GROUP_COUNT);
            self.io.read_at(group * ALLOC_GROUP_SIZE, &mut chunk)?;
            bytes.extend_from_slice(&chunk[..entries as usize * ALLOC_BYTES_PER_BLOCK]);
            group += 1;
        }

        let table = AllocationTable::from_bytes(bytes);
        for index in [0, HEADER_BLOCK_INDEX] {
            if table.get(index).ok() != Some(AllocType::Used) {
                return Err(self.corruption(format!(
                    "reserved block {} is not marked used",
                    index
                )));
            }
        }
        *self.alloc.lock() = table;

        *self.lifecycle.lock() = Lifecycle::Active;
        Ok(())
    }

    /// Tear down a store that failed to create or load
    fn abort(&self) {
        *self.lifecycle.lock() = Lifecycle::Closed;
        self.manager.free_store(self.id, self.free_store_timeout);
        self.io.close();
        self.manager.free_store_id(self.id);
    }

    /// Close the store
    ///
    /// Writes the allocation table, drains the store's cached and queued
    /// blocks, syncs and closes the file, and frees the store id. Cleanup
    /// failures are logged and teardown continues; the first one is returned.
    pub fn close(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }

        debug!(store = %self.name, id = self.id, "closing store");

        let mut first_error = None;

        if let Err(e) = self.write_allocation() {
            warn!(store = %self.name, error = %e, "failed to save allocation table on close");
            first_error.get_or_insert(e);
        }

        self.manager.free_store(self.id, self.free_store_timeout);

        if let Err(e) = self.io.sync() {
            warn!(store = %self.name, error = %e, "failed to sync store on close");
            first_error.get_or_insert(e);
        }

        self.io.close();
        self.manager.free_store_id(self.id);

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close the store and delete its file
    pub fn remove(&self) -> Result<()> {
        let closed = self.close();
        fs::remove_file(self.io.path())?;
        debug!(store = %self.name, "removed store file");
        closed
    }

    pub fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.lock()
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle() == Lifecycle::Active
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle() == Lifecycle::Closed
    }

    /// Fail unless the store accepts operations
    pub fn assert_active(&self) -> Result<()> {
        match self.lifecycle() {
            Lifecycle::Active => Ok(()),
            Lifecycle::New => Err(StoreError::IllegalState(format!(
                "store {} is not initialized",
                self.name
            ))),
            Lifecycle::Closed => Err(StoreError::IllegalState(format!(
                "store {} is closing",
                self.name
            ))),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        self.io.path()
    }

    /// Lock for this store's rows
    pub fn lock(&self) -> &Arc<Lock> {
        &self.row_lock
    }

    pub fn manager(&self) -> &Arc<BlockManager> {
        &self.manager
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub fn block_count(&self) -> u64 {
        self.alloc.lock().block_count()
    }

    pub fn file_size(&self) -> u64 {
        self.io.file_size()
    }

    pub fn flush_on_commit(&self) -> bool {
        self.io.flush_on_commit()
    }

    /// When false, allocation saves and commit-time block writes are skipped
    pub fn set_flush_on_commit(&self, flush: bool) {
        self.io.set_flush_on_commit(flush);
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.load(Ordering::SeqCst)
    }

    pub fn set_corrupted(&self, corrupted: bool) {
        self.corrupted.store(corrupted, Ordering::SeqCst);
    }

    /// Copy of the in-memory allocation table
    pub fn allocation_table(&self) -> AllocationTable {
        self.alloc.lock().clone()
    }

    /// Allocation type of the block holding `address`
    pub fn allocation_type(&self, address: u64) -> Result<AllocType> {
        let index = block_id_to_index(address);
        let result = self.alloc.lock().get(index);
        result.map_err(|e| self.alloc_error(e))
    }

    pub fn counters(&self) -> StoreCounters {
        let table = self.alloc.lock();
        let fragments_in_use = table.slots_in_use(AllocType::Fragment);
        StoreCounters {
            block_count: table.block_count(),
            file_size: self.io.file_size(),
            free_blocks: table.count(AllocType::Free),
            row_blocks: table.count(AllocType::Row),
            used_blocks: table.count(AllocType::Used),
            fragment_blocks: table.count(AllocType::Fragment),
            index_blocks: table.count(AllocType::Index),
            mini_fragment_blocks: table.count(AllocType::MiniFragment),
            fragments_in_use,
            mini_fragments_in_use: table.slots_in_use(AllocType::MiniFragment),
            fragment_bytes: fragments_in_use * FRAGMENT_SIZE as u64,
            blocks_read: self.io.blocks_read(),
            blocks_written: self.io.blocks_written(),
        }
    }

    // =========================================================================
    // Block Allocation
    // =========================================================================

    /// Allocate a zeroed block for table rows
    pub fn allocate_row(&self) -> Result<BlockHandle> {
        self.allocate_typed(AllocType::Row)
    }

    /// Allocate a zeroed general-purpose block
    pub fn allocate_block(&self) -> Result<BlockHandle> {
        self.allocate_typed(AllocType::Used)
    }

    /// Allocate a zeroed index block
    pub fn allocate_index_block(&self) -> Result<BlockHandle> {
        self.allocate_typed(AllocType::Index)
    }

    fn allocate_typed(&self, ty: AllocType) -> Result<BlockHandle> {
        self.assert_active()?;

        let index = {
            let mut table = self.alloc.lock();
            loop {
                if let Some(index) = table.allocate(ty) {
                    break index;
                }
                self.extend_file(&mut table)?;
            }
        };

        let block = self
            .manager
            .get_block(&self.io, block_index_to_id(index, self.id))?;
        block.zero();

        self.save_allocation()?;
        Ok(block)
    }

    /// Grow the file: one block while small, 256 once past 256 blocks
    ///
    /// The last new block is written as zeros so the file covers the new
    /// range; new allocation groups reserve their table block.
    fn extend_file(&self, table: &mut AllocationTable) -> Result<()> {
        let count = table.block_count();
        let grow = if count < 256 { 1 } else { 256 };
        let new_count = count + grow;

        table.grow(new_count);
        self.io
            .write_at(block_index_to_address(new_count - 1), &[0u8; BLOCK_SIZE], true)?;

        debug!(store = %self.name, from = count, to = new_count, "extended store file");
        Ok(())
    }

    /// Free a block by id or address
    ///
    /// Freeing id 0 is a no-op. Freeing a free block is a `DoubleFree`.
    pub fn free_block(&self, block_id: u64) -> Result<()> {
        if block_id == 0 {
            return Ok(());
        }
        self.assert_active()?;
        self.check_owner(block_id)?;

        let index = block_id_to_index(block_id);
        if AllocationTable::is_group_block(index) || index == HEADER_BLOCK_INDEX {
            return Err(StoreError::InvalidArgument(format!(
                "{}: block {} is reserved",
                self.name, index
            )));
        }

        let result = self.alloc.lock().free(index);
        result.map_err(|e| self.alloc_error(e))?;

        self.save_allocation()
    }

    // =========================================================================
    // Fragment Allocation
    // =========================================================================

    /// Allocate a fragment, returning its address
    pub fn allocate_fragment(&self) -> Result<u64> {
        self.assert_active()?;

        loop {
            let claimed = self.alloc.lock().claim_slot(AllocType::Fragment);
            if let Some((index, slot)) = claimed {
                self.save_allocation()?;
                return Ok(block_index_to_address(index) + slot as u64);
            }

            drop(self.allocate_typed(AllocType::Fragment)?);
        }
    }

    /// Free a fragment. The fragment block keeps its type.
    pub fn delete_fragment(&self, address: u64) -> Result<()> {
        self.release_slot(address, AllocType::Fragment)
    }

    /// Allocate a mini-fragment, returning its address
    ///
    /// Once many mini-fragments are live, new mini-fragment blocks are
    /// allocated in batches.
    pub fn allocate_mini_fragment(&self) -> Result<u64> {
        self.assert_active()?;

        loop {
            let (claimed, in_use) = {
                let mut table = self.alloc.lock();
                let claimed = table.claim_slot(AllocType::MiniFragment);
                let in_use = match claimed {
                    Some(_) => 0,
                    None => table.slots_in_use(AllocType::MiniFragment),
                };
                (claimed, in_use)
            };

            if let Some((index, slot)) = claimed {
                self.save_allocation()?;
                return Ok(block_index_to_address(index) + slot as u64);
            }

            let batch = if in_use >= MINI_FRAG_BATCH_THRESHOLD {
                MINI_FRAG_BATCH
            } else {
                1
            };
            for _ in 0..batch {
                drop(self.allocate_typed(AllocType::MiniFragment)?);
            }
        }
    }

    /// Free a mini-fragment. The mini-fragment block keeps its type.
    pub fn delete_mini_fragment(&self, address: u64) -> Result<()> {
        self.release_slot(address, AllocType::MiniFragment)
    }

    fn release_slot(&self, address: u64, ty: AllocType) -> Result<()> {
        self.assert_active()?;
        if address == 0 {
            return Err(self.corruption(format!("delete of {} at address 0", ty)));
        }

        let index = block_id_to_index(address);
        let slot = (address & STORE_ID_MASK) as usize;

        let result = self.alloc.lock().release_slot(index, slot, ty);
        result.map_err(|e| match e {
            AllocError::SlotAlreadyFree { .. } => StoreError::DoubleFree {
                store: self.name.clone(),
                address,
            },
            other => self.alloc_error(other),
        })?;

        self.save_allocation()
    }

    // =========================================================================
    // Allocation Table Persistence
    // =========================================================================

    /// Write the dirty part of the allocation table
    ///
    /// Skipped when the store does not flush on commit. Concurrent callers
    /// coalesce: at most one writes while one more waits to pick up changes
    /// made during that write.
    pub fn save_allocation(&self) -> Result<()> {
        if !self.io.flush_on_commit() {
            return Ok(());
        }
        self.write_allocation()
    }

    fn write_allocation(&self) -> Result<()> {
        if !self.alloc.lock().is_dirty() {
            return Ok(());
        }

        let ticket = SaveTicket::enter(&self.alloc_write_count);
        if ticket.position > 2 {
            return Ok(());
        }

        let _write = self.alloc_write_lock.lock();

        let (min, max, bytes) = {
            let mut table = self.alloc.lock();
            match table.take_dirty() {
                Some((min, max)) => (min, max, table.as_bytes()[min..max].to_vec()),
                None => return Ok(()),
            }
        };

        for (group, offset, (start, end)) in AllocationTable::group_writes(min, max) {
            let address = group * ALLOC_GROUP_SIZE + offset as u64;
            if let Err(e) = self
                .io
                .write_at(address, &bytes[start - min..end - min], true)
            {
                self.alloc.lock().mark_dirty(min, max);
                return Err(e);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Scans
    // =========================================================================

    /// First row block at or after `block_id`
    pub fn first_row(&self, block_id: u64) -> Result<Option<u64>> {
        self.first_block(block_id, AllocType::Row)
    }

    /// First fragment block at or after `block_id`
    pub fn first_fragment(&self, block_id: u64) -> Result<Option<u64>> {
        self.first_block(block_id, AllocType::Fragment)
    }

    /// First block of type `ty` at or after `block_id`, as a block id
    pub fn first_block(&self, block_id: u64, ty: AllocType) -> Result<Option<u64>> {
        self.assert_active()?;
        let start = block_id_to_index(block_id).max(1);
        let found = self.alloc.lock().first_of_type(start, ty);
        Ok(found.map(|index| block_index_to_id(index, self.id)))
    }

    /// Block ids of every block of type `ty`, in file order
    pub fn blocks(&self, ty: AllocType) -> impl Iterator<Item = u64> + '_ {
        let mut next = 0u64;
        std::iter::from_fn(move || {
            let id = self.first_block(next, ty).ok().flatten()?;
            next = block_index_to_address(block_id_to_index(id) + 1);
            Some(id)
        })
    }

    // =========================================================================
    // Block Access
    // =========================================================================

    /// Fetch a block through the cache and make sure it has been read
    pub fn load_block(&self, block_id: u64) -> Result<BlockHandle> {
        self.assert_active()?;
        let index = self.check_block(block_id)?;
        self.manager
            .read_block(&self.io, block_index_to_id(index, self.id))
    }

    /// Write every dirty cached block and the allocation table
    pub fn flush(&self) -> Result<()> {
        self.assert_active()?;
        self.write_allocation()?;
        self.manager.flush(self.id)
    }

    /// fsync the store file
    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    // =========================================================================
    // Block I/O
    // =========================================================================

    pub fn read_block(&self, address: u64, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.read_unit(Unit::Block, address, offset, buf)
    }

    pub fn write_block(&self, address: u64, offset: usize, src: &[u8]) -> Result<BlockHandle> {
        self.write_unit(Unit::Block, address, offset, src)
    }

    pub fn read_block_chars(&self, address: u64, offset: usize, buf: &mut [u16]) -> Result<usize> {
        self.read_chars(Unit::Block, address, offset, buf)
    }

    pub fn write_block_chars(&self, address: u64, offset: usize, src: &[u16]) -> Result<BlockHandle> {
        self.write_chars(Unit::Block, address, offset, src)
    }

    pub fn read_block_long(&self, address: u64, offset: usize) -> Result<i64> {
        self.read_long(Unit::Block, address, offset)
    }

    pub fn write_block_long(&self, address: u64, offset: usize, value: i64) -> Result<BlockHandle> {
        self.write_unit(Unit::Block, address, offset, &value.to_be_bytes())
    }

    /// Copy `len` bytes of a block to `out`
    pub fn read_block_to(
        &self,
        address: u64,
        offset: usize,
        len: usize,
        out: &mut impl Write,
    ) -> Result<()> {
        let mut buf = vec![0u8; len];
        self.read_unit(Unit::Block, address, offset, &mut buf)?;
        out.write_all(&buf)?;
        Ok(())
    }

    // =========================================================================
    // Fragment I/O
    // =========================================================================

    pub fn read_fragment(&self, address: u64, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.read_unit(Unit::Fragment, address, offset, buf)
    }

    pub fn write_fragment(&self, address: u64, offset: usize, src: &[u8]) -> Result<BlockHandle> {
        self.write_unit(Unit::Fragment, address, offset, src)
    }

    pub fn read_fragment_chars(&self, address: u64, offset: usize, buf: &mut [u16]) -> Result<usize> {
        self.read_chars(Unit::Fragment, address, offset, buf)
    }

    pub fn write_fragment_chars(&self, address: u64, offset: usize, src: &[u16]) -> Result<BlockHandle> {
        self.write_chars(Unit::Fragment, address, offset, src)
    }

    pub fn read_fragment_long(&self, address: u64, offset: usize) -> Result<i64> {
        self.read_long(Unit::Fragment, address, offset)
    }

    pub fn write_fragment_long(&self, address: u64, offset: usize, value: i64) -> Result<BlockHandle> {
        self.write_unit(Unit::Fragment, address, offset, &value.to_be_bytes())
    }

    // =========================================================================
    // Mini-Fragment I/O
    // =========================================================================

    pub fn read_mini_fragment(&self, address: u64, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.read_unit(Unit::MiniFragment, address, offset, buf)
    }

    pub fn write_mini_fragment(&self, address: u64, offset: usize, src: &[u8]) -> Result<BlockHandle> {
        self.write_unit(Unit::MiniFragment, address, offset, src)
    }

    pub fn read_mini_fragment_chars(
        &self,
        address: u64,
        offset: usize,
        buf: &mut [u16],
    ) -> Result<usize> {
        self.read_chars(Unit::MiniFragment, address, offset, buf)
    }

    pub fn write_mini_fragment_chars(
        &self,
        address: u64,
        offset: usize,
        src: &[u16],
    ) -> Result<BlockHandle> {
        self.write_chars(Unit::MiniFragment, address, offset, src)
    }

    pub fn read_mini_fragment_long(&self, address: u64, offset: usize) -> Result<i64> {
        self.read_long(Unit::MiniFragment, address, offset)
    }

    pub fn write_mini_fragment_long(
        &self,
        address: u64,
        offset: usize,
        value: i64,
    ) -> Result<BlockHandle> {
        self.write_unit(Unit::MiniFragment, address, offset, &value.to_be_bytes())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    /// Read under the block's read lock
    fn read_unit(&self, unit: Unit, address: u64, offset: usize, buf: &mut [u8]) -> Result<usize> {
        let (block_id, block_offset) = self.resolve(unit, address, offset, buf.len(), "read")?;

        let block = self.manager.read_block(&self.io, block_id)?;
        let _guard = block.lock().read(self.lock_timeout)?;
        block.read_bytes(block_offset, buf);
        Ok(buf.len())
    }

    /// Write under the block's exclusive lock, returning the dirty block
    fn write_unit(&self, unit: Unit, address: u64, offset: usize, src: &[u8]) -> Result<BlockHandle> {
        let (block_id, block_offset) = self.resolve(unit, address, offset, src.len(), "write")?;

        let block = self.manager.read_block(&self.io, block_id)?;
        {
            let _guard = block.lock().read_and_write(self.lock_timeout)?;
            block.write_bytes(block_offset, src);
        }
        Ok(block)
    }

    fn read_chars(&self, unit: Unit, address: u64, offset: usize, buf: &mut [u16]) -> Result<usize> {
        let mut bytes = vec![0u8; buf.len() * 2];
        self.read_unit(unit, address, offset, &mut bytes)?;
        for (ch, pair) in buf.iter_mut().zip(bytes.chunks_exact(2)) {
            *ch = u16::from_be_bytes([pair[0], pair[1]]);
        }
        Ok(buf.len())
    }

    fn write_chars(&self, unit: Unit, address: u64, offset: usize, src: &[u16]) -> Result<BlockHandle> {
        let bytes: Vec<u8> = src.iter().flat_map(|ch| ch.to_be_bytes()).collect();
        self.write_unit(unit, address, offset, &bytes)
    }

    fn read_long(&self, unit: Unit, address: u64, offset: usize) -> Result<i64> {
        let mut bytes = [0u8; 8];
        self.read_unit(unit, address, offset, &mut bytes)?;
        Ok(i64::from_be_bytes(bytes))
    }

    /// Check range and address, returning the block id and offset in the block
    fn resolve(
        &self,
        unit: Unit,
        address: u64,
        offset: usize,
        len: usize,
        op: &str,
    ) -> Result<(u64, usize)> {
        self.assert_active()?;

        if offset.checked_add(len).map(|end| end > unit.size()).unwrap_or(true) {
            return Err(StoreError::InvalidArgument(format!(
                "{}: {} offset {} length {} too long",
                self.name,
                unit.name(),
                offset,
                len
            )));
        }

        if address == 0 {
            return Err(self.corruption(format!("{} {} at address 0", unit.name(), op)));
        }

        let index = block_id_to_index(address);
        let low = (address & STORE_ID_MASK) as usize;

        let (ty, mask) = {
            let table = self.alloc.lock();
            let ty = table.get(index).map_err(|e| self.alloc_error(e))?;
            let mask = table.mask(index).unwrap_or(0);
            (ty, mask)
        };

        let slot = match unit {
            Unit::Block => {
                if low != 0 && low as u64 != self.id {
                    return Err(StoreError::InvalidArgument(format!(
                        "{}: block 0x{:x} belongs to store {}",
                        self.name, address, low
                    )));
                }
                if ty == AllocType::Free {
                    return Err(self.corruption(format!(
                        "block {} at 0x{:x} is free",
                        op, address
                    )));
                }
                0
            }
            Unit::Fragment | Unit::MiniFragment => {
                let expected = if unit == Unit::Fragment {
                    AllocType::Fragment
                } else {
                    AllocType::MiniFragment
                };
                let slots = expected.slot_count().unwrap_or(0);
                if ty != expected || low >= slots || mask & (1 << low) == 0 {
                    return Err(self.corruption(format!(
                        "{} {} at 0x{:x} does not address a live {} (block is {})",
                        unit.name(),
                        op,
                        address,
                        expected,
                        ty
                    )));
                }
                low
            }
        };

        Ok((
            block_index_to_id(index, self.id),
            slot * unit.size() + offset,
        ))
    }

    /// Validate a block id or address for this store, returning its index
    fn check_block(&self, block_id: u64) -> Result<u64> {
        if block_id == 0 {
            return Err(self.corruption("block access at address 0".to_string()));
        }
        self.check_owner(block_id)?;

        let index = block_id_to_index(block_id);
        let count = self.block_count();
        if index >= count {
            return Err(self.corruption(format!(
                "block {} is past the end of the store ({} blocks)",
                index, count
            )));
        }
        Ok(index)
    }

    fn check_owner(&self, block_id: u64) -> Result<()> {
        let low = block_id & STORE_ID_MASK;
        if low != 0 && low != self.id {
            return Err(StoreError::InvalidArgument(format!(
                "block 0x{:x} must match store {}",
                block_id, self
            )));
        }
        Ok(())
    }

    /// Flag the store corrupted and build the error
    pub(crate) fn corruption(&self, detail: String) -> StoreError {
        self.set_corrupted(true);
        warn!(store = %self.name, detail = %detail, "store corruption detected");
        StoreError::Corruption {
            store: self.name.clone(),
            detail,
        }
    }

    fn alloc_error(&self, e: AllocError) -> StoreError {
        match e {
            AllocError::AlreadyFree { index } => StoreError::DoubleFree {
                store: self.name.clone(),
                address: block_index_to_address(index),
            },
            AllocError::SlotAlreadyFree { index, slot } => StoreError::DoubleFree {
                store: self.name.clone(),
                address: block_index_to_address(index) + slot as u64,
            },
            other => self.corruption(other.to_string()),
        }
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if self.lifecycle() != Lifecycle::Closed {
            if let Err(e) = self.close() {
                warn!(store = %self.name, error = %e, "failed to close store on drop");
            }
        }
    }
}

impl fmt::Display for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockStore[{}:{}]", self.name, self.id)
    }
}

impl fmt::Debug for BlockStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockStore")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("lifecycle", &self.lifecycle())
            .field("corrupted", &self.is_corrupted())
            .finish()
    }
}
