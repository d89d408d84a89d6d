//! Block Module
//!
//! Cached pages of store files and the process-wide cache that owns them.
//!
//! ## Responsibilities
//! - One `Block` per cached page: buffer, dirty range, validity, use count
//! - `BlockHandle`: a counted reference that releases the block on drop
//! - `BlockManager`: LRU cache keyed by block id, shared by every store
//! - Background write-back of dirty blocks that left the cache
//! - Store id allocation (id 0 reserved)
//!
//! ## Block Ids
//! ```text
//! ┌──────────────────────────────────────┬──────────────────┐
//! │ block index (51 bits)                │ store id (13 b)  │
//! └──────────────────────────────────────┴──────────────────┘
//!   block id      = (index << BLOCK_BITS) + store_id
//!   block address = (index << BLOCK_BITS)
//! ```
//!
//! ## Block States
//! ```text
//! invalid → valid(clean) ⇄ valid(dirty) → writing → valid(clean)
//!                                            any → freed (use count 0)
//! ```

mod block;
mod handle;
mod manager;
mod store_ids;
mod writer;

pub use block::{Block, BlockState};
pub use handle::BlockHandle;
pub use manager::{BlockManager, ManagerStats};
pub use store_ids::StoreIdAllocator;

/// log2 of the block size
pub const BLOCK_BITS: u32 = 13;

/// Size of every block in bytes (8 KiB)
pub const BLOCK_SIZE: usize = 1 << BLOCK_BITS;

/// Low bits of a block id holding the store id
pub const STORE_ID_MASK: u64 = (BLOCK_SIZE as u64) - 1;

/// Largest number of stores open at once (ids 1..MAX_STORES)
pub const MAX_STORES: usize = BLOCK_SIZE;

/// Block id for a block index inside a store
pub fn block_index_to_id(index: u64, store_id: u64) -> u64 {
    (index << BLOCK_BITS) + store_id
}

/// File address of a block index
pub fn block_index_to_address(index: u64) -> u64 {
    index << BLOCK_BITS
}

/// Block index encoded in a block id or address
pub fn block_id_to_index(id: u64) -> u64 {
    id >> BLOCK_BITS
}

/// Store id encoded in a block id
pub fn block_id_to_store_id(id: u64) -> u64 {
    id & STORE_ID_MASK
}

/// File address of the block containing `id` (also strips fragment slots)
pub fn block_id_to_address(id: u64) -> u64 {
    id & !STORE_ID_MASK
}
