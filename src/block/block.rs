//! A cached page of a store file.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{Result, StoreError};
use crate::lock::Lock;
use crate::store::StoreIo;

use super::{block_id_to_address, block_id_to_index, block_id_to_store_id, BLOCK_SIZE};

/// Observable state of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Buffer has not been read from disk
    Invalid,
    /// Buffer matches disk
    Clean,
    /// Buffer has unwritten changes
    Dirty,
    /// A write of the last dirty snapshot is in progress
    Writing,
    /// Use count reached zero; the block left the cache
    Freed,
}

struct BlockData {
    buffer: Box<[u8]>,
    /// Dirty range is `[dirty_min, dirty_max)`; empty when min >= max
    dirty_min: usize,
    dirty_max: usize,
    valid: bool,
    writing: bool,
    freed: bool,
}

impl BlockData {
    fn is_dirty(&self) -> bool {
        self.dirty_min < self.dirty_max
    }

    fn clear_dirty(&mut self) {
        self.dirty_min = BLOCK_SIZE;
        self.dirty_max = 0;
    }

    fn add_dirty(&mut self, min: usize, max: usize) {
        self.dirty_min = self.dirty_min.min(min);
        self.dirty_max = self.dirty_max.max(max);
    }
}

/// One BLOCK_SIZE page of a store file
///
/// ## Concurrency:
/// - `data`: buffer and dirty range, held only for copies
/// - `io_lock`: serializes `write()` snapshots so one dirty range is written
///   once; distinct from the resource `lock` callers take around I/O calls
/// - `use_count`: the cache holds one reference, each `BlockHandle` another
pub struct Block {
    id: u64,
    io: Arc<StoreIo>,
    data: Mutex<BlockData>,
    io_lock: Mutex<()>,
    use_count: AtomicUsize,
    lock: Arc<Lock>,
}

impl Block {
    pub(crate) fn new(id: u64, io: Arc<StoreIo>) -> Self {
        let lock = Arc::new(Lock::new(format!("{}:block:{:x}", io.name(), id)));
        Self {
            id,
            io,
            data: Mutex::new(BlockData {
                buffer: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
                dirty_min: BLOCK_SIZE,
                dirty_max: 0,
                valid: false,
                writing: false,
                freed: false,
            }),
            io_lock: Mutex::new(()),
            use_count: AtomicUsize::new(0),
            lock,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn index(&self) -> u64 {
        block_id_to_index(self.id)
    }

    pub fn store_id(&self) -> u64 {
        block_id_to_store_id(self.id)
    }

    /// File address of the block
    pub fn address(&self) -> u64 {
        block_id_to_address(self.id)
    }

    pub(crate) fn io(&self) -> &Arc<StoreIo> {
        &self.io
    }

    pub fn store_name(&self) -> &str {
        self.io.name()
    }

    /// Resource lock guarding reads and writes of this block's contents
    pub fn lock(&self) -> &Arc<Lock> {
        &self.lock
    }

    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> BlockState {
        let data = self.data.lock();
        if data.freed {
            BlockState::Freed
        } else if data.writing {
            BlockState::Writing
        } else if !data.valid {
            BlockState::Invalid
        } else if data.is_dirty() {
            BlockState::Dirty
        } else {
            BlockState::Clean
        }
    }

    pub fn is_valid(&self) -> bool {
        self.data.lock().valid
    }

    pub fn is_dirty(&self) -> bool {
        self.data.lock().is_dirty()
    }

    /// Current dirty range, if any
    pub fn dirty_range(&self) -> Option<(usize, usize)> {
        let data = self.data.lock();
        data.is_dirty().then_some((data.dirty_min, data.dirty_max))
    }

    // =========================================================================
    // Reference Counting
    // =========================================================================

    pub(crate) fn allocate(&self) {
        self.use_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one reference. Returns true when this released the last one.
    pub(crate) fn free_ref(&self) -> bool {
        let prev = self
            .use_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        prev == 1
    }

    pub(crate) fn mark_freed(&self) {
        self.data.lock().freed = true;
    }

    // =========================================================================
    // Disk I/O
    // =========================================================================

    /// Fill the buffer from disk. No-op if already valid.
    pub fn read(&self) -> Result<()> {
        let mut data = self.data.lock();
        if data.valid {
            return Ok(());
        }

        let address = self.address();
        self.io.read_at(address, &mut data.buffer)?;
        data.valid = true;
        trace!(store = %self.io.name(), block = self.id, "block read");
        Ok(())
    }

    /// Write the dirty range to disk
    ///
    /// The dirty range is snapshotted and cleared under `io_lock`; a
    /// concurrent caller finds it empty and returns. On failure the range is
    /// restored so the bytes stay dirty.
    pub fn write(&self) -> Result<()> {
        let _io = self.io_lock.lock();

        let (min, bytes) = {
            let mut data = self.data.lock();
            if !data.is_dirty() {
                return Ok(());
            }
            let (min, max) = (data.dirty_min, data.dirty_max);
            let bytes = data.buffer[min..max].to_vec();
            data.clear_dirty();
            data.writing = true;
            (min, bytes)
        };

        let result = self
            .io
            .write_at(self.address() + min as u64, &bytes, false);

        let mut data = self.data.lock();
        data.writing = false;
        if result.is_err() {
            data.add_dirty(min, min + bytes.len());
        } else {
            trace!(
                store = %self.io.name(),
                block = self.id,
                offset = min,
                len = bytes.len(),
                "block written"
            );
        }
        result
    }

    /// Write the block at the end of a transaction
    ///
    /// Waits until no other thread is mid-write on the block's lock, then
    /// writes if the store flushes dirty blocks on commit.
    pub fn commit(&self, timeout: Duration) -> Result<()> {
        self.lock.wait_for_commit(timeout)?;

        if self.io.flush_on_commit() {
            self.write()
        } else {
            Ok(())
        }
    }

    // =========================================================================
    // Buffer Access
    // =========================================================================

    /// Extend the dirty range by `[min, max)`
    pub fn set_dirty(&self, min: usize, max: usize) {
        debug_assert!(min <= max && max <= BLOCK_SIZE);
        self.data.lock().add_dirty(min, max);
    }

    /// Mark the buffer as holding current contents without reading disk
    pub fn validate(&self) {
        self.data.lock().valid = true;
    }

    /// Force the next `read()` to go to disk
    pub fn invalidate(&self) -> Result<()> {
        let mut data = self.data.lock();
        if data.is_dirty() {
            return Err(StoreError::IllegalState(format!(
                "{}: block 0x{:x} invalidated with pending writes [{}, {})",
                self.io.name(),
                self.id,
                data.dirty_min,
                data.dirty_max
            )));
        }
        data.valid = false;
        Ok(())
    }

    /// Zero the whole buffer and mark it valid and dirty
    pub fn zero(&self) {
        let mut data = self.data.lock();
        data.buffer.fill(0);
        data.valid = true;
        data.add_dirty(0, BLOCK_SIZE);
    }

    pub fn with_buffer<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.lock();
        f(&data.buffer)
    }

    /// Mutable access to the buffer. The caller marks what it changed.
    pub fn with_buffer_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.lock();
        f(&mut data.buffer)
    }

    /// Copy `src` to `offset` and mark the range dirty
    pub fn write_bytes(&self, offset: usize, src: &[u8]) {
        let mut data = self.data.lock();
        let end = offset + src.len();
        data.buffer[offset..end].copy_from_slice(src);
        data.add_dirty(offset, end);
    }

    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) {
        let data = self.data.lock();
        dst.copy_from_slice(&data.buffer[offset..offset + dst.len()]);
    }

    /// Hand this block's contents and dirty range to a replacement block
    ///
    /// Used when a cache miss finds the id still waiting for write-back. The
    /// source's dirty range is cleared so its queued write becomes a no-op.
    pub fn copy_to_block(&self, target: &Block) {
        let _io = self.io_lock.lock();
        let mut source = self.data.lock();
        let mut dest = target.data.lock();

        dest.buffer.copy_from_slice(&source.buffer);
        dest.valid = source.valid;
        if source.is_dirty() {
            let (min, max) = (source.dirty_min, source.dirty_max);
            dest.add_dirty(min, max);
            source.clear_dirty();
        }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("store", &self.io.name())
            .field("id", &format_args!("0x{:x}", self.id))
            .field("use_count", &self.use_count())
            .field("state", &self.state())
            .finish()
    }
}
