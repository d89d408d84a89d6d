//! Transaction
//!
//! Collects the locks and deferred work of one logical operation.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::block::BlockHandle;
use crate::error::{Result, StoreError};
use crate::inode::Inode;
use crate::lock::Lock;
use crate::store::BlockStore;

use super::{TransactionPool, WriteBlock};

/// Per-transaction collections, reused through the pool
#[derive(Default)]
pub(crate) struct TxBuffers {
    /// Locks held for read (including ones later upgraded)
    read_locks: Vec<Arc<Lock>>,
    /// Read locks to upgrade at commit
    pending_upgrades: Vec<Arc<Lock>>,
    /// Read locks whose write flag is held
    upgraded: Vec<Arc<Lock>>,
    /// Locks held exclusively
    exclusive: Vec<Arc<Lock>>,
    write_blocks: BTreeMap<u64, WriteBlock>,
    delete_inodes: Vec<Inode>,
    add_inodes: Vec<Inode>,
    deallocate_blocks: Vec<(Arc<BlockStore>, u64)>,
}

impl TxBuffers {
    fn clear(&mut self) {
        self.read_locks.clear();
        self.pending_upgrades.clear();
        self.upgraded.clear();
        self.exclusive.clear();
        self.write_blocks.clear();
        self.delete_inodes.clear();
        self.add_inodes.clear();
        self.deallocate_blocks.clear();
    }
}

fn contains(locks: &[Arc<Lock>], lock: &Arc<Lock>) -> bool {
    locks.iter().any(|held| Arc::ptr_eq(held, lock))
}

/// One unit of work
///
/// ## Usage:
/// ```text
/// let mut xa = pool.begin();
/// xa.lock_read(store.lock())?;
/// xa.lock_write(store.lock())?;          // upgraded at commit
/// let block = store.write_block(addr, 0, bytes)?;
/// xa.add_update_block(block)?;
/// xa.commit()?;                          // flush, then release locks
/// ```
///
/// Dropping an uncommitted transaction rolls it back.
pub struct Transaction {
    id: u64,
    timeout: Duration,
    auto_commit: bool,
    rollback_only: bool,
    completed: bool,
    buffers: TxBuffers,
    pool: Option<Arc<TransactionPool>>,
}

impl Transaction {
    /// Stand-alone multi-operation transaction
    pub fn new(timeout: Duration) -> Self {
        Self::with_buffers(0, timeout, false, TxBuffers::default(), None)
    }

    /// Stand-alone auto-commit transaction
    pub fn auto_commit(timeout: Duration) -> Self {
        Self::with_buffers(0, timeout, true, TxBuffers::default(), None)
    }

    pub(crate) fn with_buffers(
        id: u64,
        timeout: Duration,
        auto_commit: bool,
        buffers: TxBuffers,
        pool: Option<Arc<TransactionPool>>,
    ) -> Self {
        trace!(xa = id, auto_commit, "transaction begin");
        Self {
            id,
            timeout,
            auto_commit,
            rollback_only: false,
            completed: false,
            buffers,
            pool,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn is_auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn set_auto_commit(&mut self, auto_commit: bool) {
        self.auto_commit = auto_commit;
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn read_lock_count(&self) -> usize {
        self.buffers.read_locks.len()
    }

    /// Locks held with the write flag (upgraded or exclusive)
    pub fn write_lock_count(&self) -> usize {
        self.buffers.upgraded.len() + self.buffers.exclusive.len()
    }

    pub fn pending_upgrade_count(&self) -> usize {
        self.buffers.pending_upgrades.len()
    }

    pub fn write_block_count(&self) -> usize {
        self.buffers.write_blocks.len()
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Take a read lock unless this transaction already holds `lock`
    pub fn lock_read(&mut self, lock: &Arc<Lock>) -> Result<()> {
        self.assert_usable()?;

        let b = &self.buffers;
        if contains(&b.read_locks, lock) || contains(&b.exclusive, lock) {
            return Ok(());
        }

        lock.lock_read(self.timeout)?;
        self.buffers.read_locks.push(Arc::clone(lock));
        Ok(())
    }

    /// Request write access: take the read lock now, upgrade at commit
    pub fn lock_write(&mut self, lock: &Arc<Lock>) -> Result<()> {
        self.assert_usable()?;

        let b = &self.buffers;
        if contains(&b.exclusive, lock)
            || contains(&b.upgraded, lock)
            || contains(&b.pending_upgrades, lock)
        {
            return Ok(());
        }

        self.lock_read(lock)?;
        self.buffers.pending_upgrades.push(Arc::clone(lock));
        Ok(())
    }

    /// Take `lock` for read and write immediately
    ///
    /// A lock this transaction already reads is upgraded in place.
    pub fn lock_read_and_write(&mut self, lock: &Arc<Lock>) -> Result<()> {
        self.assert_usable()?;

        if contains(&self.buffers.exclusive, lock) || contains(&self.buffers.upgraded, lock) {
            return Ok(());
        }

        if contains(&self.buffers.read_locks, lock) {
            lock.lock_write(self.timeout)?;
            self.buffers
                .pending_upgrades
                .retain(|held| !Arc::ptr_eq(held, lock));
            self.buffers.upgraded.push(Arc::clone(lock));
            return Ok(());
        }

        lock.lock_read_and_write(self.timeout)?;
        self.buffers.exclusive.push(Arc::clone(lock));
        Ok(())
    }

    /// Take `lock` exclusively only if it is free right now
    pub fn lock_read_and_write_no_wait(&mut self, lock: &Arc<Lock>) -> bool {
        if self.rollback_only || self.completed {
            return false;
        }
        if contains(&self.buffers.exclusive, lock) {
            return true;
        }
        if lock.lock_read_and_write_no_wait() {
            self.buffers.exclusive.push(Arc::clone(lock));
            true
        } else {
            false
        }
    }

    // =========================================================================
    // Deferred Work
    // =========================================================================

    /// Register a dirty block to be written at commit
    ///
    /// The handle pins the block in the cache until the transaction ends.
    pub fn create_write_block(&mut self, block: BlockHandle) -> Result<()> {
        self.assert_usable()?;
        self.buffers
            .write_blocks
            .insert(block.id(), WriteBlock::Buffered(block));
        Ok(())
    }

    /// Write a dirty block now and release it, keeping only its id
    pub fn create_auto_commit_write_block(&mut self, block: BlockHandle) -> Result<()> {
        self.assert_usable()?;
        block.commit(self.timeout)?;
        let id = block.id();
        drop(block);
        self.buffers
            .write_blocks
            .insert(id, WriteBlock::AutoCommit(id));
        Ok(())
    }

    /// Register a block changed by this transaction, per its commit mode
    pub fn add_update_block(&mut self, block: BlockHandle) -> Result<()> {
        if self.auto_commit {
            self.create_auto_commit_write_block(block)
        } else {
            self.create_write_block(block)
        }
    }

    /// Remove `inode`'s storage when the transaction commits
    pub fn delete_inode(&mut self, inode: Inode) {
        self.buffers.delete_inodes.push(inode);
    }

    /// Track an inode created by this transaction; rollback removes it
    pub fn add_inode(&mut self, inode: Inode) {
        self.buffers.add_inodes.push(inode);
    }

    /// Free `block_id` in `store` when the transaction commits
    pub fn deallocate_block(&mut self, store: &Arc<BlockStore>, block_id: u64) {
        self.buffers
            .deallocate_blocks
            .push((Arc::clone(store), block_id));
    }

    // =========================================================================
    // Completion
    // =========================================================================

    /// Commit and release every lock
    ///
    /// Fails with `RollbackOnly` (after rolling back) if the transaction was
    /// marked rollback-only. Locks are released even when commit fails.
    pub fn commit(mut self) -> Result<()> {
        if self.rollback_only {
            self.rollback_work();
            self.completed = true;
            return Err(StoreError::RollbackOnly);
        }

        let result = self.commit_work();
        self.release_locks();
        self.completed = true;

        match &result {
            Ok(()) => trace!(xa = self.id, "transaction committed"),
            Err(e) => warn!(xa = self.id, error = %e, "transaction commit failed"),
        }
        result
    }

    /// Discard deferred work and release every lock
    pub fn rollback(mut self) -> Result<()> {
        self.rollback_work();
        self.completed = true;
        trace!(xa = self.id, "transaction rolled back");
        Ok(())
    }

    /// Release locks and discard deferred work now; the transaction can
    /// only be rolled back afterwards
    pub fn set_rollback_only(&mut self) {
        if self.rollback_only {
            return;
        }
        debug!(xa = self.id, "transaction marked rollback-only");
        self.rollback_work();
        self.rollback_only = true;
    }

    fn commit_work(&mut self) -> Result<()> {
        while let Some(lock) = self.buffers.pending_upgrades.pop() {
            lock.lock_write(self.timeout)?;
            self.buffers.upgraded.push(lock);
        }

        for mut inode in mem::take(&mut self.buffers.delete_inodes) {
            inode.remove()?;
        }

        for write_block in self.buffers.write_blocks.values() {
            if !write_block.is_auto_commit() {
                write_block.commit(self.timeout)?;
            }
        }
        self.buffers.write_blocks.clear();

        for (store, block_id) in mem::take(&mut self.buffers.deallocate_blocks) {
            store.free_block(block_id)?;
        }

        self.buffers.add_inodes.clear();
        Ok(())
    }

    fn rollback_work(&mut self) {
        for mut inode in mem::take(&mut self.buffers.add_inodes) {
            if let Err(e) = inode.remove() {
                warn!(xa = self.id, error = %e, "failed to remove inode on rollback");
            }
        }

        self.buffers.write_blocks.clear();
        self.buffers.delete_inodes.clear();
        self.buffers.deallocate_blocks.clear();
        self.release_locks();
    }

    /// Release in the order exclusive → upgraded → read
    fn release_locks(&mut self) {
        for lock in self.buffers.exclusive.drain(..) {
            lock.unlock_read_and_write();
        }
        for lock in self.buffers.upgraded.drain(..) {
            lock.unlock_write();
        }
        self.buffers.pending_upgrades.clear();
        for lock in self.buffers.read_locks.drain(..) {
            lock.unlock_read();
        }
    }

    fn assert_usable(&self) -> Result<()> {
        if self.rollback_only {
            return Err(StoreError::IllegalState(format!(
                "transaction {} is rollback-only",
                self.id
            )));
        }
        if self.completed {
            return Err(StoreError::IllegalState(format!(
                "transaction {} is complete",
                self.id
            )));
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.completed {
            self.rollback_work();
        }

        let mut buffers = mem::take(&mut self.buffers);
        buffers.clear();
        if let Some(pool) = self.pool.take() {
            pool.recycle(buffers);
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("auto_commit", &self.auto_commit)
            .field("rollback_only", &self.rollback_only)
            .field("read_locks", &self.read_lock_count())
            .field("write_locks", &self.write_lock_count())
            .field("write_blocks", &self.write_block_count())
            .finish()
    }
}
