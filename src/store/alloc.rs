//! Allocation Table
//!
//! In-memory copy of a store's allocation table: one 8-byte entry per block
//! holding the block's type and, for fragment blocks, a mask of live slots.
//! The owning store persists the dirty byte range.

use thiserror::Error;

use crate::block::BLOCK_SIZE;

use super::{AllocType, ALLOC_BYTES_PER_BLOCK, ALLOC_GROUP_COUNT};

const MASK_OFFSET: usize = 4;

/// Allocation table misuse, mapped to store errors by the owner
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("block {index} is already free")]
    AlreadyFree { index: u64 },

    #[error("slot {slot} of block {index} is already free")]
    SlotAlreadyFree { index: u64, slot: usize },

    #[error("block {index} is {found}, expected {expected}")]
    WrongType {
        index: u64,
        expected: AllocType,
        found: AllocType,
    },

    #[error("block {index} is outside the table ({count} blocks)")]
    OutOfRange { index: u64, count: u64 },

    #[error("block {index} has unknown allocation code {code}")]
    UnknownCode { index: u64, code: u8 },
}

/// Allocation table with a dirty byte range and scan cursors
///
/// Not synchronized; the owning store keeps it behind its allocation lock.
#[derive(Debug, Clone)]
pub struct AllocationTable {
    bytes: Vec<u8>,
    dirty_min: usize,
    dirty_max: usize,
    /// No free block below this index
    free_cursor: u64,
    /// No fragment block with a free slot below these indexes
    fragment_cursor: u64,
    mini_cursor: u64,
}

impl Default for AllocationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AllocationTable {
    /// Empty table describing zero blocks
    pub fn new() -> Self {
        Self::from_bytes(Vec::new())
    }

    /// Table loaded from disk. Trailing partial entries are dropped.
    pub fn from_bytes(mut bytes: Vec<u8>) -> Self {
        let whole = bytes.len() - bytes.len() % ALLOC_BYTES_PER_BLOCK;
        bytes.truncate(whole);
        Self {
            bytes,
            dirty_min: usize::MAX,
            dirty_max: 0,
            free_cursor: 0,
            fragment_cursor: 0,
            mini_cursor: 0,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Number of blocks the table describes
    pub fn block_count(&self) -> u64 {
        (self.bytes.len() / ALLOC_BYTES_PER_BLOCK) as u64
    }

    /// True for blocks holding a table group
    pub fn is_group_block(index: u64) -> bool {
        index % ALLOC_GROUP_COUNT == 0
    }

    // =========================================================================
    // Entries
    // =========================================================================

    pub fn get(&self, index: u64) -> Result<AllocType, AllocError> {
        let offset = self.offset(index)?;
        let code = self.bytes[offset];
        AllocType::from_code(code).ok_or(AllocError::UnknownCode { index, code })
    }

    pub fn mask(&self, index: u64) -> Result<u32, AllocError> {
        let offset = self.offset(index)? + MASK_OFFSET;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&self.bytes[offset..offset + 4]);
        Ok(u32::from_be_bytes(raw))
    }

    /// Set a block's type and clear its slot mask
    pub fn set(&mut self, index: u64, ty: AllocType) -> Result<(), AllocError> {
        let offset = self.offset(index)?;
        self.bytes[offset..offset + ALLOC_BYTES_PER_BLOCK].fill(0);
        self.bytes[offset] = ty.code();
        self.mark_dirty(offset, offset + ALLOC_BYTES_PER_BLOCK);

        match ty {
            AllocType::Free => self.free_cursor = self.free_cursor.min(index),
            AllocType::Fragment | AllocType::MiniFragment => {
                let cursor = self.slot_cursor(ty).min(index);
                self.set_slot_cursor(ty, cursor);
            }
            _ => {}
        }
        Ok(())
    }

    fn set_mask(&mut self, index: u64, mask: u32) -> Result<(), AllocError> {
        let offset = self.offset(index)? + MASK_OFFSET;
        self.bytes[offset..offset + 4].copy_from_slice(&mask.to_be_bytes());
        self.mark_dirty(offset, offset + 4);
        Ok(())
    }

    /// Mark a block free
    ///
    /// Returns the type it had. Freeing a free block is an error.
    pub fn free(&mut self, index: u64) -> Result<AllocType, AllocError> {
        let old = self.get(index)?;
        if old == AllocType::Free {
            return Err(AllocError::AlreadyFree { index });
        }
        self.set(index, AllocType::Free)?;
        Ok(old)
    }

    // =========================================================================
    // Block Scans
    // =========================================================================

    /// Claim the first free block at or after the cursor as `ty`
    ///
    /// Returns None when the table has no free block; the caller extends
    /// the file and retries.
    pub fn allocate(&mut self, ty: AllocType) -> Option<u64> {
        let count = self.block_count();
        let index = (self.free_cursor..count)
            .find(|i| matches!(self.get(*i), Ok(AllocType::Free)))?;

        self.free_cursor = index + 1;
        // set() on a valid index cannot fail
        self.set(index, ty).ok()?;
        Some(index)
    }

    /// First block at or after `start` of type `ty`
    pub fn first_of_type(&self, start: u64, ty: AllocType) -> Option<u64> {
        (start..self.block_count()).find(|i| matches!(self.get(*i), Ok(t) if t == ty))
    }

    /// Grow the table to `new_count` blocks
    ///
    /// New entries are free, except the first block of every allocation
    /// group which holds that group's table and is marked used.
    pub fn grow(&mut self, new_count: u64) {
        let old_count = self.block_count();
        if new_count <= old_count {
            return;
        }

        let old_len = self.bytes.len();
        self.bytes
            .resize(new_count as usize * ALLOC_BYTES_PER_BLOCK, 0);
        self.mark_dirty(old_len, self.bytes.len());

        for index in old_count..new_count {
            if Self::is_group_block(index) {
                let offset = index as usize * ALLOC_BYTES_PER_BLOCK;
                self.bytes[offset] = AllocType::Used.code();
            }
        }
    }

    // =========================================================================
    // Fragment Slots
    // =========================================================================

    /// Claim a free slot in any block of `ty` with room
    ///
    /// Returns `(block index, slot)`, or None if every such block is full.
    pub fn claim_slot(&mut self, ty: AllocType) -> Option<(u64, usize)> {
        let slots = ty.slot_count()?;
        let full = full_mask(slots);
        let start = self.slot_cursor(ty);

        let index = (start..self.block_count()).find(|i| {
            matches!(self.get(*i), Ok(t) if t == ty)
                && self.mask(*i).map(|m| m != full).unwrap_or(false)
        })?;

        let mask = self.mask(index).ok()?;
        let slot = (!mask).trailing_zeros() as usize;
        self.set_mask(index, mask | (1 << slot)).ok()?;
        self.set_slot_cursor(ty, index);
        Some((index, slot))
    }

    /// Release a slot. The block keeps its type when it empties.
    pub fn release_slot(&mut self, index: u64, slot: usize, ty: AllocType) -> Result<(), AllocError> {
        let found = self.get(index)?;
        let slots = ty.slot_count().unwrap_or(0);
        if found != ty || slot >= slots {
            return Err(AllocError::WrongType {
                index,
                expected: ty,
                found,
            });
        }

        let mask = self.mask(index)?;
        if mask & (1 << slot) == 0 {
            return Err(AllocError::SlotAlreadyFree { index, slot });
        }
        self.set_mask(index, mask & !(1 << slot))?;

        let cursor = self.slot_cursor(ty).min(index);
        self.set_slot_cursor(ty, cursor);
        Ok(())
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Number of blocks of type `ty`
    pub fn count(&self, ty: AllocType) -> u64 {
        (0..self.block_count())
            .filter(|i| matches!(self.get(*i), Ok(t) if t == ty))
            .count() as u64
    }

    /// Number of live slots across blocks of type `ty`
    pub fn slots_in_use(&self, ty: AllocType) -> u64 {
        (0..self.block_count())
            .filter(|i| matches!(self.get(*i), Ok(t) if t == ty))
            .filter_map(|i| self.mask(i).ok())
            .map(|m| m.count_ones() as u64)
            .sum()
    }

    // =========================================================================
    // Dirty Range
    // =========================================================================

    pub fn is_dirty(&self) -> bool {
        self.dirty_min < self.dirty_max
    }

    /// Take and clear the dirty byte range
    pub fn take_dirty(&mut self) -> Option<(usize, usize)> {
        if !self.is_dirty() {
            return None;
        }
        let range = (self.dirty_min, self.dirty_max);
        self.dirty_min = usize::MAX;
        self.dirty_max = 0;
        Some(range)
    }

    /// Split a dirty byte range into per-group writes
    ///
    /// Yields `(group, offset in group block, byte range in table)`.
    pub fn group_writes(min: usize, max: usize) -> Vec<(u64, usize, (usize, usize))> {
        let mut writes = Vec::new();
        let mut pos = min;
        while pos < max {
            let group = (pos / BLOCK_SIZE) as u64;
            let offset = pos % BLOCK_SIZE;
            let end = max.min((pos / BLOCK_SIZE + 1) * BLOCK_SIZE);
            writes.push((group, offset, (pos, end)));
            pos = end;
        }
        writes
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn offset(&self, index: u64) -> Result<usize, AllocError> {
        let count = self.block_count();
        if index >= count {
            return Err(AllocError::OutOfRange { index, count });
        }
        Ok(index as usize * ALLOC_BYTES_PER_BLOCK)
    }

    /// Extend the dirty byte range
    pub fn mark_dirty(&mut self, min: usize, max: usize) {
        self.dirty_min = self.dirty_min.min(min);
        self.dirty_max = self.dirty_max.max(max);
    }

    fn slot_cursor(&self, ty: AllocType) -> u64 {
        match ty {
            AllocType::MiniFragment => self.mini_cursor,
            _ => self.fragment_cursor,
        }
    }

    fn set_slot_cursor(&mut self, ty: AllocType, index: u64) {
        match ty {
            AllocType::MiniFragment => self.mini_cursor = index,
            _ => self.fragment_cursor = index,
        }
    }
}

fn full_mask(slots: usize) -> u32 {
    if slots >= 32 {
        u32::MAX
    } else {
        (1u32 << slots) - 1
    }
}
