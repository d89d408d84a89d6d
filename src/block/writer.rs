//! Background write-back of dirty blocks that left the cache.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::Receiver;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::StoreIo;

use super::{block_id_to_store_id, Block};

/// Blocks queued for write-back, keyed by block id
///
/// A cache miss checks here first so it sees the newest buffer, and
/// `free_store` waits here until a store has nothing left in flight.
#[derive(Default)]
pub(crate) struct PendingWrites {
    blocks: Mutex<HashMap<u64, Arc<Block>>>,
    drained: Condvar,
}

impl PendingWrites {
    pub fn insert(&self, block: Arc<Block>) {
        self.blocks.lock().insert(block.id(), block);
    }

    /// Pending block for `id`, if it belongs to the file behind `io`
    ///
    /// Store ids are reused, so an entry left by a closed store must not
    /// leak into a new store that took its id.
    pub fn get(&self, io: &Arc<StoreIo>, id: u64) -> Option<Arc<Block>> {
        self.blocks
            .lock()
            .get(&id)
            .filter(|pending| Arc::ptr_eq(pending.io(), io))
            .cloned()
    }

    /// Remove `block` if it is still the pending entry for its id
    pub fn complete(&self, block: &Arc<Block>) {
        let mut blocks = self.blocks.lock();
        if blocks
            .get(&block.id())
            .map(|pending| Arc::ptr_eq(pending, block))
            .unwrap_or(false)
        {
            blocks.remove(&block.id());
        }
        self.drained.notify_all();
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    pub fn count_for_store(&self, store_id: u64) -> usize {
        self.blocks
            .lock()
            .keys()
            .filter(|id| block_id_to_store_id(**id) == store_id)
            .count()
    }

    /// Wait until no block of `store_id` is pending. Returns false on timeout.
    pub fn wait_for_store(&self, store_id: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut blocks = self.blocks.lock();

        loop {
            let pending = blocks
                .keys()
                .any(|id| block_id_to_store_id(*id) == store_id);
            if !pending {
                return true;
            }
            if self.drained.wait_until(&mut blocks, deadline).timed_out() {
                return !blocks
                    .keys()
                    .any(|id| block_id_to_store_id(*id) == store_id);
            }
        }
    }
}

/// Write a released block and retire it from the pending set
pub(crate) fn write_back(pending: &PendingWrites, block: &Arc<Block>) {
    if block.io().is_closed() {
        debug!(
            store = %block.store_name(),
            block = block.id(),
            "dropping write-back for closed store"
        );
    } else if let Err(e) = block.write() {
        warn!(
            store = %block.store_name(),
            block = block.id(),
            error = %e,
            "write-back failed"
        );
    }
    block.mark_freed();
    pending.complete(block);
}

/// Start the single writer thread draining `rx` in FIFO order
///
/// The thread exits when every sender is dropped.
pub(crate) fn spawn_writer(
    rx: Receiver<Arc<Block>>,
    pending: Arc<PendingWrites>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("blockvault-writer".to_string())
        .spawn(move || {
            debug!("block writer started");
            for block in rx.iter() {
                write_back(&pending, &block);
            }
            debug!("block writer stopped");
        })?;
    Ok(handle)
}
