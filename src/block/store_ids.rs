//! Store id bitmap.

use parking_lot::Mutex;

use crate::error::{Result, StoreError};

use super::MAX_STORES;

/// Hands out store ids in `1..MAX_STORES`
///
/// Id 0 is reserved so that a block id of 0 never names a real block.
pub struct StoreIdAllocator {
    bits: Mutex<Vec<u64>>,
}

impl Default for StoreIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreIdAllocator {
    pub fn new() -> Self {
        let mut bits = vec![0u64; MAX_STORES / 64];
        bits[0] = 1;
        Self {
            bits: Mutex::new(bits),
        }
    }

    /// Claim the lowest free id
    pub fn allocate(&self) -> Result<u64> {
        let mut bits = self.bits.lock();

        for (word_index, word) in bits.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                *word |= 1 << bit;
                return Ok((word_index * 64 + bit) as u64);
            }
        }

        Err(StoreError::IllegalState(format!(
            "all {} store ids are in use",
            MAX_STORES - 1
        )))
    }

    /// Return an id. Freeing id 0 or an unallocated id is ignored.
    pub fn free(&self, id: u64) {
        let id = id as usize;
        if id == 0 || id >= MAX_STORES {
            return;
        }
        self.bits.lock()[id / 64] &= !(1u64 << (id % 64));
    }

    pub fn is_allocated(&self, id: u64) -> bool {
        let id = id as usize;
        id < MAX_STORES && self.bits.lock()[id / 64] & (1u64 << (id % 64)) != 0
    }

    pub fn allocated_count(&self) -> usize {
        let reserved = 1;
        self.bits
            .lock()
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum::<usize>()
            - reserved
    }
}
