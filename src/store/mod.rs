//! Store Module
//!
//! One `BlockStore` per data file: allocation table, block / fragment /
//! mini-fragment allocators, and the byte/char/long I/O primitives.
//!
//! ## Responsibilities
//! - Create a fresh store file or load an existing one
//! - Allocate and free blocks, fragments and mini-fragments
//! - Persist the allocation table as it changes
//! - Read and write at block, fragment and mini-fragment granularity
//!   under the block's lock
//! - Flag the store corrupted when an address cannot be trusted
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────┐
//! │ Block 0: allocation table, group 0     │
//! │ ┌────────┬──────────┬────────────────┐ │
//! │ │Type (1)│ zero (3) │ Slot mask (4)  │ │  × 1024 blocks
//! │ └────────┴──────────┴────────────────┘ │
//! ├────────────────────────────────────────┤
//! │ Block 1: header                        │
//! │ ┌──────────┬─────────────┬──────────┐  │
//! │ │ Len (4)  │ bincode hdr │ CRC32(4) │  │
//! │ └──────────┴─────────────┴──────────┘  │
//! ├────────────────────────────────────────┤
//! │ Blocks 2..1023: data                   │
//! ├────────────────────────────────────────┤
//! │ Block 1024: allocation table, group 1  │
//! │ ...                                    │
//! └────────────────────────────────────────┘
//! ```
//! Fragments (4 per block) and mini-fragments (32 per block) are addressed
//! as `block address + slot`; the slot mask in the block's table entry
//! records which slots are live.

mod alloc;
mod block_store;
mod header;
mod io;

use std::fmt;
use std::str::FromStr;

pub use alloc::{AllocError, AllocationTable};
pub use block_store::{BlockStore, Lifecycle, StoreCounters};
pub use header::StoreHeader;
pub use io::StoreIo;

pub use crate::block::{BLOCK_BITS, BLOCK_SIZE};

/// Bytes of allocation table per block
pub const ALLOC_BYTES_PER_BLOCK: usize = 8;

/// Blocks described by one table block (one allocation group)
pub const ALLOC_GROUP_COUNT: u64 = (BLOCK_SIZE / ALLOC_BYTES_PER_BLOCK) as u64;

/// Bytes of file covered by one allocation group
pub const ALLOC_GROUP_SIZE: u64 = ALLOC_GROUP_COUNT * BLOCK_SIZE as u64;

/// Fragment size (a quarter block)
pub const FRAGMENT_SIZE: usize = BLOCK_SIZE / 4;

pub const FRAGMENTS_PER_BLOCK: usize = BLOCK_SIZE / FRAGMENT_SIZE;

/// Mini-fragment size
pub const MINI_FRAG_SIZE: usize = 256;

pub const MINI_FRAGS_PER_BLOCK: usize = BLOCK_SIZE / MINI_FRAG_SIZE;

/// Block index of the header block
pub const HEADER_BLOCK_INDEX: u64 = 1;

/// Once this many mini-fragments are live, new mini-fragment blocks are
/// allocated in batches
pub const MINI_FRAG_BATCH_THRESHOLD: u64 = 256;

/// Mini-fragment blocks allocated per batch
pub const MINI_FRAG_BATCH: usize = 16;

/// Allocation type of a block, stored in byte 0 of its table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum AllocType {
    Free = 0,
    Row = 1,
    Used = 2,
    Fragment = 3,
    Index = 4,
    MiniFragment = 5,
}

impl AllocType {
    pub const ALL: [AllocType; 6] = [
        AllocType::Free,
        AllocType::Row,
        AllocType::Used,
        AllocType::Fragment,
        AllocType::Index,
        AllocType::MiniFragment,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            AllocType::Free => "free",
            AllocType::Row => "row",
            AllocType::Used => "used",
            AllocType::Fragment => "fragment",
            AllocType::Index => "index",
            AllocType::MiniFragment => "mini-fragment",
        }
    }

    /// Number of sub-slots for fragment-style blocks
    pub fn slot_count(self) -> Option<usize> {
        match self {
            AllocType::Fragment => Some(FRAGMENTS_PER_BLOCK),
            AllocType::MiniFragment => Some(MINI_FRAGS_PER_BLOCK),
            _ => None,
        }
    }
}

impl fmt::Display for AllocType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AllocType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.name() == s)
            .ok_or_else(|| format!("unknown allocation type '{}'", s))
    }
}
