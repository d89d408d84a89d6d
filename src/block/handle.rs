//! Counted reference to a cached block.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use super::manager::ManagerShared;
use super::Block;

/// A reference to a cached `Block`
///
/// Cloning takes another reference; dropping gives it back. When the last
/// reference goes (the cache's own included) the block is released: dirty
/// blocks are queued for write-back, clean ones are freed.
pub struct BlockHandle {
    block: Arc<Block>,
    shared: Arc<ManagerShared>,
}

impl BlockHandle {
    /// Wrap a block whose use count already includes this reference
    pub(crate) fn new(block: Arc<Block>, shared: Arc<ManagerShared>) -> Self {
        Self { block, shared }
    }

    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }
}

impl Deref for BlockHandle {
    type Target = Block;

    fn deref(&self) -> &Block {
        &self.block
    }
}

impl Clone for BlockHandle {
    fn clone(&self) -> Self {
        self.block.allocate();
        Self {
            block: Arc::clone(&self.block),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        if self.block.free_ref() {
            self.shared.release(Arc::clone(&self.block));
        }
    }
}

impl fmt::Debug for BlockHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.block, f)
    }
}
