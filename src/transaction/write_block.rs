//! Deferred block writes registered with a transaction.

use std::time::Duration;

use crate::block::BlockHandle;
use crate::error::Result;

/// A block a transaction changed
///
/// Buffered blocks stay pinned in the cache until commit, so a transaction
/// that touches more blocks than the cache holds grows it past capacity
/// until it completes. Auto-commit blocks are written on registration and
/// only their id is kept.
#[derive(Debug, Clone)]
pub enum WriteBlock {
    /// Already written; the block id
    AutoCommit(u64),
    /// Written when the transaction commits
    Buffered(BlockHandle),
}

impl WriteBlock {
    pub fn id(&self) -> u64 {
        match self {
            WriteBlock::AutoCommit(id) => *id,
            WriteBlock::Buffered(block) => block.id(),
        }
    }

    /// The pinned block, for buffered writes
    pub fn block(&self) -> Option<&BlockHandle> {
        match self {
            WriteBlock::AutoCommit(_) => None,
            WriteBlock::Buffered(block) => Some(block),
        }
    }

    pub fn is_auto_commit(&self) -> bool {
        matches!(self, WriteBlock::AutoCommit(_))
    }

    /// Write a buffered block if its store flushes on commit
    pub fn commit(&self, timeout: Duration) -> Result<()> {
        match self {
            WriteBlock::AutoCommit(_) => Ok(()),
            WriteBlock::Buffered(block) => block.commit(timeout),
        }
    }
}
