//! Inode Module
//!
//! A 128-byte descriptor for a variable-length byte (blob) or UTF-16 (clob)
//! value stored in a `BlockStore`.
//!
//! ## Layout
//! ```text
//! ┌──────────────┬──────────────────────────────────────────────┐
//! │ length (BE)  │ 15 × u64 slots (BE)                          │
//! │   8 bytes    │ 120 bytes                                    │
//! └──────────────┴──────────────────────────────────────────────┘
//! ```
//!
//! ## Tiers
//! | length                    | storage                                     |
//! |---------------------------|---------------------------------------------|
//! | ≤ 120                     | inline in the slot bytes                    |
//! | ≤ 3 840                   | slot i → 256-byte mini-fragment i           |
//! | ≤ 1 077 248               | slots 0..14 → 2 KiB fragments, slot 14 →    |
//! |                           | indirect block, entries 0..512 → fragments  |
//! | ≤ 1 077 248 + 2 GiB       | indirect entries 512..768 → double-indirect |
//! |                           | blocks → 8 KiB data blocks                  |
//!
//! Leaving the inline or mini-fragment tier moves the existing bytes into the
//! new tier. Growing past the fragment ceiling keeps the fragment prefix.

mod inode;
mod stream;

pub use inode::{
    Inode, InodeTier, BLOCK_MAX, DIRECT_FRAGMENTS, DOUBLE_INDIRECT_BLOCKS, FRAGMENT_MAX,
    INDIRECT_FRAGMENTS, INLINE_BLOB_SIZE, INODE_SIZE, INODE_SLOTS, MINI_FRAG_MAX,
};
pub use stream::{BlobInputStream, BlobOutputStream, ClobReader, ClobWriter};
