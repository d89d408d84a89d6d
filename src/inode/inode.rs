//! Inode
//!
//! Tiered storage of one blob value behind a 128-byte descriptor.

use std::fmt;
use std::io::Write;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::block::BLOCK_SIZE;
use crate::error::{Result, StoreError};
use crate::store::{BlockStore, FRAGMENT_SIZE, MINI_FRAG_SIZE};
use crate::transaction::Transaction;

/// Size of a serialized inode
pub const INODE_SIZE: usize = 128;

/// Largest value kept inline in the inode
pub const INLINE_BLOB_SIZE: usize = INODE_SIZE - 8;

/// Address slots after the length word
pub const INODE_SLOTS: usize = INLINE_BLOB_SIZE / 8;

/// Fragments addressed directly from the inode
pub const DIRECT_FRAGMENTS: usize = INODE_SLOTS - 1;

/// Slot holding the indirect block in the fragment and block tiers
const INDIRECT_SLOT: usize = DIRECT_FRAGMENTS;

/// Largest value stored in mini-fragments
pub const MINI_FRAG_MAX: u64 = (INODE_SLOTS * MINI_FRAG_SIZE) as u64;

/// Fragments addressed through the indirect block
pub const INDIRECT_FRAGMENTS: usize = 512;

/// Largest value stored in fragments
pub const FRAGMENT_MAX: u64 = ((DIRECT_FRAGMENTS + INDIRECT_FRAGMENTS) * FRAGMENT_SIZE) as u64;

/// First indirect-block entry addressing a double-indirect block
const DOUBLE_INDIRECT_START: usize = INDIRECT_FRAGMENTS;

/// Double-indirect blocks reachable from the indirect block
pub const DOUBLE_INDIRECT_BLOCKS: usize = 256;

/// 8-byte addresses per address block
const ADDRESSES_PER_BLOCK: usize = BLOCK_SIZE / 8;

/// Largest value an inode can hold
pub const BLOCK_MAX: u64 = FRAGMENT_MAX
    + DOUBLE_INDIRECT_BLOCKS as u64 * ADDRESSES_PER_BLOCK as u64 * BLOCK_SIZE as u64;

// =============================================================================
// Tiers
// =============================================================================

/// Storage tier, fixed by the value's length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeTier {
    Inline,
    MiniFragment,
    Fragment,
    Block,
}

impl InodeTier {
    pub fn for_length(length: u64) -> Self {
        if length <= INLINE_BLOB_SIZE as u64 {
            InodeTier::Inline
        } else if length <= MINI_FRAG_MAX {
            InodeTier::MiniFragment
        } else if length <= FRAGMENT_MAX {
            InodeTier::Fragment
        } else {
            InodeTier::Block
        }
    }

    /// Fragment and block tiers share positional addressing
    fn is_large(self) -> bool {
        matches!(self, InodeTier::Fragment | InodeTier::Block)
    }
}

impl fmt::Display for InodeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InodeTier::Inline => "inline",
            InodeTier::MiniFragment => "mini-fragment",
            InodeTier::Fragment => "fragment",
            InodeTier::Block => "block",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitKind {
    Mini,
    Fragment,
    Block,
}

impl UnitKind {
    fn size(self) -> usize {
        match self {
            UnitKind::Mini => MINI_FRAG_SIZE,
            UnitKind::Fragment => FRAGMENT_SIZE,
            UnitKind::Block => BLOCK_SIZE,
        }
    }

    fn name(self) -> &'static str {
        match self {
            UnitKind::Mini => "mini-fragment",
            UnitKind::Fragment => "fragment",
            UnitKind::Block => "data block",
        }
    }
}

/// The storage unit holding a byte position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UnitPos {
    kind: UnitKind,
    index: usize,
    offset: usize,
}

impl UnitPos {
    fn at(pos: u64, large: bool) -> Self {
        let (kind, rel) = if !large {
            (UnitKind::Mini, pos)
        } else if pos < FRAGMENT_MAX {
            (UnitKind::Fragment, pos)
        } else {
            (UnitKind::Block, pos - FRAGMENT_MAX)
        };
        let size = kind.size() as u64;
        Self {
            kind,
            index: (rel / size) as usize,
            offset: (rel % size) as usize,
        }
    }

    fn available(&self) -> usize {
        self.kind.size() - self.offset
    }
}

fn unit_count(length: u64, size: usize) -> usize {
    let size = size as u64;
    ((length + size - 1) / size) as usize
}

// =============================================================================
// Inode
// =============================================================================

/// Descriptor of one blob or clob value
///
/// Changes go through a `Transaction`: every block an operation dirties is
/// registered with it. The inode bytes themselves live wherever the caller
/// keeps them, usually inside a row block (`load` / `save`).
#[derive(Clone)]
pub struct Inode {
    store: Arc<BlockStore>,
    bytes: [u8; INODE_SIZE],
}

impl Inode {
    /// Empty inode in `store`
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self {
            store,
            bytes: [0u8; INODE_SIZE],
        }
    }

    pub fn from_bytes(store: Arc<BlockStore>, bytes: &[u8]) -> Result<Self> {
        let array: [u8; INODE_SIZE] = bytes.try_into().map_err(|_| {
            StoreError::InvalidArgument(format!(
                "inode must be {} bytes, got {}",
                INODE_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self {
            store,
            bytes: array,
        })
    }

    /// Read an inode stored at `offset` in the block at `address`
    pub fn load(store: Arc<BlockStore>, address: u64, offset: usize) -> Result<Self> {
        let mut bytes = [0u8; INODE_SIZE];
        store.read_block(address, offset, &mut bytes)?;
        Ok(Self { store, bytes })
    }

    /// Write the inode at `offset` in the block at `address`
    pub fn save(&self, xa: &mut Transaction, address: u64, offset: usize) -> Result<()> {
        let block = self.store.write_block(address, offset, &self.bytes)?;
        xa.add_update_block(block)
    }

    pub fn as_bytes(&self) -> &[u8; INODE_SIZE] {
        &self.bytes
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// Value length in bytes
    pub fn length(&self) -> u64 {
        self.word(0)
    }

    /// Value length in UTF-16 code units
    pub fn char_length(&self) -> u64 {
        self.length() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    pub fn tier(&self) -> InodeTier {
        InodeTier::for_length(self.length())
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Append `data` to the value
    ///
    /// Fails with `Unsupported` when the result would exceed `BLOCK_MAX`.
    pub fn append(&mut self, xa: &mut Transaction, data: &[u8]) -> Result<()> {
        self.store.assert_active()?;

        let old_len = self.length();
        let new_len = old_len + data.len() as u64;
        if new_len > BLOCK_MAX {
            return Err(StoreError::Unsupported(format!(
                "{}: blob of {} bytes exceeds the {} byte limit",
                self.store.name(),
                new_len,
                BLOCK_MAX
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let old_tier = InodeTier::for_length(old_len);
        let new_tier = InodeTier::for_length(new_len);

        if new_tier == InodeTier::Inline {
            let start = 8 + old_len as usize;
            self.bytes[start..start + data.len()].copy_from_slice(data);
            self.set_length(new_len);
            return Ok(());
        }

        let large = new_tier.is_large();
        let migrate = old_len > 0
            && (old_tier == InodeTier::Inline
                || (old_tier == InodeTier::MiniFragment && large));
        if migrate {
            self.migrate(xa, old_tier, new_tier)?;
        }

        let start = self.length();
        self.write_from(xa, start, data, large)
    }

    /// UTF-16 BE encode `chars` and append them
    pub fn append_chars(&mut self, xa: &mut Transaction, chars: &[u16]) -> Result<()> {
        let bytes: Vec<u8> = chars.iter().flat_map(|ch| ch.to_be_bytes()).collect();
        self.append(xa, &bytes)
    }

    pub fn append_str(&mut self, xa: &mut Transaction, text: &str) -> Result<()> {
        let chars: Vec<u16> = text.encode_utf16().collect();
        self.append_chars(xa, &chars)
    }

    /// Move the current value into the tier its next length needs
    ///
    /// On failure the inode keeps its old contents; units already
    /// allocated for the copy are leaked.
    fn migrate(&mut self, xa: &mut Transaction, from: InodeTier, to: InodeTier) -> Result<()> {
        let length = self.length();
        let mut existing = vec![0u8; length as usize];
        self.read(0, &mut existing)?;

        let old_minis: Vec<u64> = match from {
            InodeTier::MiniFragment => (0..unit_count(length, MINI_FRAG_SIZE))
                .map(|i| self.slot(i))
                .collect(),
            _ => Vec::new(),
        };

        let saved = self.bytes;
        self.bytes = [0u8; INODE_SIZE];
        if let Err(e) = self.write_from(xa, 0, &existing, to.is_large()) {
            self.bytes = saved;
            return Err(e);
        }

        for address in old_minis {
            self.store.delete_mini_fragment(address)?;
        }

        debug!(store = %self.store.name(), from = %from, to = %to, length, "migrated inode");
        Ok(())
    }

    /// Write `data` at `start`, allocating each unit as the write reaches it
    fn write_from(
        &mut self,
        xa: &mut Transaction,
        start: u64,
        data: &[u8],
        large: bool,
    ) -> Result<()> {
        let mut pos = start;
        let mut rest = data;

        while !rest.is_empty() {
            let unit = UnitPos::at(pos, large);
            let n = unit.available().min(rest.len());

            let address = if unit.offset == 0 {
                self.allocate_unit(xa, unit)?
            } else {
                self.unit_address(unit)?
            };

            let block = match unit.kind {
                UnitKind::Mini => self.store.write_mini_fragment(address, unit.offset, &rest[..n])?,
                UnitKind::Fragment => self.store.write_fragment(address, unit.offset, &rest[..n])?,
                UnitKind::Block => self.store.write_block(address, unit.offset, &rest[..n])?,
            };
            xa.add_update_block(block)?;

            pos += n as u64;
            rest = &rest[n..];
            self.set_length(pos);
        }
        Ok(())
    }

    fn allocate_unit(&mut self, xa: &mut Transaction, unit: UnitPos) -> Result<u64> {
        match unit.kind {
            UnitKind::Mini => {
                let address = self.store.allocate_mini_fragment()?;
                self.set_slot(unit.index, address);
                Ok(address)
            }
            UnitKind::Fragment => {
                let address = self.store.allocate_fragment()?;
                if unit.index < DIRECT_FRAGMENTS {
                    self.set_slot(unit.index, address);
                    return Ok(address);
                }

                if unit.index == DIRECT_FRAGMENTS {
                    let indirect = self.allocate_address_block(xa)?;
                    self.set_slot(INDIRECT_SLOT, indirect);
                }
                let indirect = self.indirect_address()?;
                self.write_address(xa, indirect, unit.index - DIRECT_FRAGMENTS, address)?;
                Ok(address)
            }
            UnitKind::Block => {
                let double_index = unit.index / ADDRESSES_PER_BLOCK;
                let entry = unit.index % ADDRESSES_PER_BLOCK;

                let double = if entry == 0 {
                    let indirect = self.indirect_address()?;
                    let double = self.allocate_address_block(xa)?;
                    self.write_address(xa, indirect, DOUBLE_INDIRECT_START + double_index, double)?;
                    double
                } else {
                    self.double_indirect_address(double_index)?
                };

                let block = self.store.allocate_block()?;
                let address = block.address();
                xa.add_update_block(block)?;
                self.write_address(xa, double, entry, address)?;
                Ok(address)
            }
        }
    }

    /// Allocate a zeroed block of addresses
    fn allocate_address_block(&self, xa: &mut Transaction) -> Result<u64> {
        let block = self.store.allocate_block()?;
        let address = block.address();
        xa.add_update_block(block)?;
        Ok(address)
    }

    fn write_address(
        &self,
        xa: &mut Transaction,
        block_address: u64,
        entry: usize,
        address: u64,
    ) -> Result<()> {
        let block = self
            .store
            .write_block_long(block_address, entry * 8, address as i64)?;
        xa.add_update_block(block)
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Copy up to `buf.len()` bytes starting at `offset`
    ///
    /// Returns the number of bytes copied; 0 at or past the end.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let length = self.length();
        if offset >= length || buf.is_empty() {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(length - offset) as usize;

        let tier = InodeTier::for_length(length);
        if tier == InodeTier::Inline {
            let start = 8 + offset as usize;
            buf[..n].copy_from_slice(&self.bytes[start..start + n]);
            return Ok(n);
        }

        let large = tier.is_large();
        let mut pos = offset;
        let mut done = 0;
        while done < n {
            let unit = UnitPos::at(pos, large);
            let chunk = unit.available().min(n - done);
            let address = self.unit_address(unit)?;
            let dst = &mut buf[done..done + chunk];

            match unit.kind {
                UnitKind::Mini => self.store.read_mini_fragment(address, unit.offset, dst)?,
                UnitKind::Fragment => self.store.read_fragment(address, unit.offset, dst)?,
                UnitKind::Block => self.store.read_block(address, unit.offset, dst)?,
            };

            done += chunk;
            pos += chunk as u64;
        }
        Ok(n)
    }

    /// Copy UTF-16 code units starting at code unit `char_offset`
    pub fn read_chars(&self, char_offset: u64, buf: &mut [u16]) -> Result<usize> {
        let mut bytes = vec![0u8; buf.len() * 2];
        let n = self.read(char_offset * 2, &mut bytes)? / 2;
        for (ch, pair) in buf.iter_mut().zip(bytes[..n * 2].chunks_exact(2)) {
            *ch = u16::from_be_bytes([pair[0], pair[1]]);
        }
        Ok(n)
    }

    /// Decode the whole value as a clob
    pub fn read_string(&self) -> Result<String> {
        let mut chars = vec![0u16; self.char_length() as usize];
        let n = self.read_chars(0, &mut chars)?;
        String::from_utf16(&chars[..n])
            .map_err(|e| StoreError::Serialization(format!("clob is not valid UTF-16: {}", e)))
    }

    /// Copy the whole value to `out`, returning the bytes written
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<u64> {
        let length = self.length();
        let mut buf = vec![0u8; BLOCK_SIZE.min(length as usize)];
        let mut offset = 0;
        while offset < length {
            let n = self.read(offset, &mut buf)?;
            out.write_all(&buf[..n])?;
            offset += n as u64;
        }
        Ok(length)
    }

    // =========================================================================
    // Remove
    // =========================================================================

    /// Free every unit of the value and reset the inode to empty
    ///
    /// Missing or already-free units are logged and skipped; bad addresses
    /// flag the store corrupted. Only a closed store fails the call.
    pub fn remove(&mut self) -> Result<()> {
        self.store.assert_active()?;

        let length = self.length();
        match InodeTier::for_length(length) {
            InodeTier::Inline => {}
            InodeTier::MiniFragment => {
                for index in 0..unit_count(length, MINI_FRAG_SIZE) {
                    let address = self.checked(self.slot(index) as i64, UnitKind::Mini.name(), index);
                    self.release("mini-fragment", index, address, BlockStore::delete_mini_fragment);
                }
            }
            InodeTier::Fragment | InodeTier::Block => self.remove_large(length),
        }

        self.bytes = [0u8; INODE_SIZE];
        Ok(())
    }

    fn remove_large(&self, length: u64) {
        let fragments = unit_count(length.min(FRAGMENT_MAX), FRAGMENT_SIZE);
        for index in 0..fragments {
            let unit = UnitPos {
                kind: UnitKind::Fragment,
                index,
                offset: 0,
            };
            self.release("fragment", index, self.unit_address(unit), BlockStore::delete_fragment);
        }

        if length > FRAGMENT_MAX {
            let blocks = unit_count(length - FRAGMENT_MAX, BLOCK_SIZE);
            for index in 0..blocks {
                let unit = UnitPos {
                    kind: UnitKind::Block,
                    index,
                    offset: 0,
                };
                self.release("data block", index, self.unit_address(unit), BlockStore::free_block);
            }
            for index in 0..unit_count(blocks as u64, ADDRESSES_PER_BLOCK) {
                let address = self.double_indirect_address(index);
                self.release("double-indirect block", index, address, BlockStore::free_block);
            }
        }

        if fragments > DIRECT_FRAGMENTS {
            self.release("indirect block", 0, self.indirect_address(), BlockStore::free_block);
        }
    }

    fn release(
        &self,
        what: &str,
        index: usize,
        address: Result<u64>,
        free: fn(&BlockStore, u64) -> Result<()>,
    ) {
        let result = address.and_then(|address| free(self.store.as_ref(), address));
        if let Err(e) = result {
            warn!(
                store = %self.store.name(),
                unit = what,
                index,
                error = %e,
                "failed to release inode storage"
            );
        }
    }

    // =========================================================================
    // Addressing
    // =========================================================================

    fn unit_address(&self, unit: UnitPos) -> Result<u64> {
        match unit.kind {
            UnitKind::Mini => self.checked(self.slot(unit.index) as i64, unit.kind.name(), unit.index),
            UnitKind::Fragment if unit.index < DIRECT_FRAGMENTS => {
                self.checked(self.slot(unit.index) as i64, unit.kind.name(), unit.index)
            }
            UnitKind::Fragment => {
                let indirect = self.indirect_address()?;
                let entry = unit.index - DIRECT_FRAGMENTS;
                let address = self.store.read_block_long(indirect, entry * 8)?;
                self.checked(address, unit.kind.name(), unit.index)
            }
            UnitKind::Block => {
                let double = self.double_indirect_address(unit.index / ADDRESSES_PER_BLOCK)?;
                let entry = unit.index % ADDRESSES_PER_BLOCK;
                let address = self.store.read_block_long(double, entry * 8)?;
                self.checked(address, unit.kind.name(), unit.index)
            }
        }
    }

    fn indirect_address(&self) -> Result<u64> {
        self.checked(self.slot(INDIRECT_SLOT) as i64, "indirect block", 0)
    }

    fn double_indirect_address(&self, index: usize) -> Result<u64> {
        let indirect = self.indirect_address()?;
        let address = self
            .store
            .read_block_long(indirect, (DOUBLE_INDIRECT_START + index) * 8)?;
        self.checked(address, "double-indirect block", index)
    }

    /// Zero and negative addresses mean the inode is damaged
    fn checked(&self, address: i64, what: &str, index: usize) -> Result<u64> {
        if address <= 0 {
            return Err(self.store.corruption(format!(
                "inode {} {} has address {}",
                what, index, address
            )));
        }
        Ok(address as u64)
    }

    fn word(&self, index: usize) -> u64 {
        let start = index * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[start..start + 8]);
        u64::from_be_bytes(raw)
    }

    fn set_word(&mut self, index: usize, value: u64) {
        let start = index * 8;
        self.bytes[start..start + 8].copy_from_slice(&value.to_be_bytes());
    }

    fn set_length(&mut self, length: u64) {
        self.set_word(0, length);
    }

    fn slot(&self, index: usize) -> u64 {
        self.word(index + 1)
    }

    fn set_slot(&mut self, index: usize, address: u64) {
        self.set_word(index + 1, address);
    }
}

impl fmt::Debug for Inode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inode")
            .field("store", &self.store.name())
            .field("length", &self.length())
            .field("tier", &self.tier())
            .finish()
    }
}
