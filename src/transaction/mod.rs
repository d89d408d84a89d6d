//! Transaction Module
//!
//! A unit of work over one or more stores: the locks it holds and the
//! block writes, inode removals and block frees it defers to commit.
//!
//! ## Responsibilities
//! - Idempotent read / write / exclusive lock acquisition per lock object
//! - Registering dirty blocks as auto-commit or buffered write blocks
//! - Commit: finish pending upgrades, remove inodes, flush write blocks,
//!   free blocks, release locks exclusive → upgraded → read
//! - Rollback and rollback-only handling
//! - Pooling of the per-transaction buffers
//!
//! ## Commit Order
//! ```text
//! upgrade pending write locks
//!        │
//!        ▼
//! remove deleted inodes ─▶ flush write blocks ─▶ free deallocated blocks
//!                                                        │
//!                                                        ▼
//!                           release: exclusive → upgraded → read
//! ```
//! A failure part way through does not undo work already done; blocks
//! flushed before the failure stay written.

mod pool;
mod transaction;
mod write_block;

pub use pool::TransactionPool;
pub use transaction::Transaction;
pub use write_block::WriteBlock;
