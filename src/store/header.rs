//! Store Header
//!
//! Block 1 of every store file describes the format it was written with.
//!
//! ## Format
//! ```text
//! ┌──────────┬──────────────────────────┬──────────┐
//! │ Len (4)  │ bincode StoreHeader      │ CRC32(4) │
//! └──────────┴──────────────────────────┴──────────┘
//! ```
//! Length and CRC are big-endian; the CRC covers the bincode payload.

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

use super::{ALLOC_BYTES_PER_BLOCK, BLOCK_SIZE, FRAGMENT_SIZE, MINI_FRAG_SIZE};

/// Magic bytes at the start of the header payload
pub const MAGIC: [u8; 4] = *b"BVLT";

/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Format description stored in the header block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub block_size: u32,
    pub alloc_bytes_per_block: u32,
    pub fragment_size: u32,
    pub mini_fragment_size: u32,
}

impl Default for StoreHeader {
    fn default() -> Self {
        Self::current()
    }
}

impl StoreHeader {
    /// Header describing the format this build writes
    pub fn current() -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            block_size: BLOCK_SIZE as u32,
            alloc_bytes_per_block: ALLOC_BYTES_PER_BLOCK as u32,
            fragment_size: FRAGMENT_SIZE as u32,
            mini_fragment_size: MINI_FRAG_SIZE as u32,
        }
    }

    /// Encode into a full zero-padded block
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        let crc = crc32fast::hash(&payload);

        let mut block = vec![0u8; BLOCK_SIZE];
        let len = payload.len();
        block[0..4].copy_from_slice(&(len as u32).to_be_bytes());
        block[4..4 + len].copy_from_slice(&payload);
        block[4 + len..8 + len].copy_from_slice(&crc.to_be_bytes());
        Ok(block)
    }

    /// Decode and verify a header block read from `store`
    pub fn decode(store: &str, block: &[u8]) -> Result<Self> {
        if block.len() < 8 {
            return Err(StoreError::Format(format!(
                "{}: header block truncated",
                store
            )));
        }

        let len = u32::from_be_bytes([block[0], block[1], block[2], block[3]]) as usize;
        if len == 0 || 8 + len > block.len() {
            return Err(StoreError::Format(format!(
                "{}: header length {} is invalid",
                store, len
            )));
        }

        let payload = &block[4..4 + len];
        let stored = u32::from_be_bytes([
            block[4 + len],
            block[5 + len],
            block[6 + len],
            block[7 + len],
        ]);
        let actual = crc32fast::hash(payload);
        if stored != actual {
            return Err(StoreError::Corruption {
                store: store.to_string(),
                detail: format!(
                    "header checksum mismatch (stored {:08x}, computed {:08x})",
                    stored, actual
                ),
            });
        }

        let header: StoreHeader = bincode::deserialize(payload)?;
        header.check(store)?;
        Ok(header)
    }

    /// Reject a header written with a different format
    pub fn check(&self, store: &str) -> Result<()> {
        if self.magic != MAGIC {
            return Err(StoreError::Format(format!(
                "{}: not a store file (magic {:?})",
                store, self.magic
            )));
        }

        let current = Self::current();
        if *self != current {
            return Err(StoreError::Format(format!(
                "{}: unsupported format {:?}, expected {:?}",
                store, self, current
            )));
        }
        Ok(())
    }
}
