//! Tests for BlockStore I/O primitives
//!
//! These tests verify:
//! - Byte, UTF-16 and 8-byte integer round trips at block, fragment and
//!   mini-fragment granularity
//! - Range checks against the addressed unit
//! - Zero and unallocated addresses raise corruption
//! - Data survives close and reopen

use std::sync::Arc;

use blockvault::store::{BLOCK_SIZE, FRAGMENT_SIZE, MINI_FRAG_SIZE};
use blockvault::{BlockStore, Config, Database, StoreError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store(name: &str) -> (TempDir, Database, Arc<BlockStore>) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .block_cache_bytes(4 * 1024 * 1024)
        .build();
    let db = Database::open(config).unwrap();
    let store = db.create_store(name).unwrap();
    (temp_dir, db, store)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// =============================================================================
// Block I/O Tests
// =============================================================================

#[test]
fn test_block_bytes_round_trip() {
    let (_temp, _db, store) = setup_store("block-bytes");
    let address = store.allocate_block().unwrap().address();

    let data = pattern(BLOCK_SIZE, 7);
    store.write_block(address, 0, &data).unwrap();

    let mut buf = vec![0u8; BLOCK_SIZE];
    assert_eq!(store.read_block(address, 0, &mut buf).unwrap(), BLOCK_SIZE);
    assert_eq!(buf, data);
}

#[test]
fn test_block_partial_ranges() {
    let (_temp, _db, store) = setup_store("block-partial");
    let address = store.allocate_block().unwrap().address();

    store.write_block(address, 100, b"hello").unwrap();
    store.write_block(address, BLOCK_SIZE - 3, b"end").unwrap();

    let mut buf = [0u8; 5];
    store.read_block(address, 100, &mut buf).unwrap();
    assert_eq!(&buf, b"hello");

    let mut tail = [0u8; 3];
    store.read_block(address, BLOCK_SIZE - 3, &mut tail).unwrap();
    assert_eq!(&tail, b"end");

    let mut before = [0xFFu8; 100];
    store.read_block(address, 0, &mut before).unwrap();
    assert!(before.iter().all(|b| *b == 0));
}

#[test]
fn test_block_chars_and_longs() {
    let (_temp, _db, store) = setup_store("block-typed");
    let address = store.allocate_block().unwrap().address();

    let text: Vec<u16> = "héllo wörld ✓".encode_utf16().collect();
    store.write_block_chars(address, 10, &text).unwrap();
    let mut chars = vec![0u16; text.len()];
    store.read_block_chars(address, 10, &mut chars).unwrap();
    assert_eq!(chars, text);

    // stored big-endian
    let mut raw = [0u8; 2];
    store.read_block(address, 10, &mut raw).unwrap();
    assert_eq!(raw, text[0].to_be_bytes());

    store.write_block_long(address, 4000, -42).unwrap();
    store.write_block_long(address, BLOCK_SIZE - 8, i64::MAX).unwrap();
    assert_eq!(store.read_block_long(address, 4000).unwrap(), -42);
    assert_eq!(store.read_block_long(address, BLOCK_SIZE - 8).unwrap(), i64::MAX);
}

#[test]
fn test_block_range_too_long() {
    let (_temp, _db, store) = setup_store("block-range");
    let address = store.allocate_block().unwrap().address();

    let err = store.write_block(address, BLOCK_SIZE - 2, b"abc").unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));

    let err = store.read_block_long(address, BLOCK_SIZE - 4).unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
    assert!(!store.is_corrupted());
}

#[test]
fn test_read_block_to_writer() {
    let (_temp, _db, store) = setup_store("block-to");
    let address = store.allocate_block().unwrap().address();
    store.write_block(address, 20, b"streamed bytes").unwrap();

    let mut out = Vec::new();
    store.read_block_to(address, 20, 14, &mut out).unwrap();
    assert_eq!(out, b"streamed bytes");
}

// =============================================================================
// Fragment I/O Tests
// =============================================================================

#[test]
fn test_fragment_round_trips() {
    let (_temp, _db, store) = setup_store("fragment-io");
    let fragments: Vec<u64> = (0..4).map(|_| store.allocate_fragment().unwrap()).collect();

    for (i, address) in fragments.iter().enumerate() {
        store
            .write_fragment(*address, 0, &pattern(FRAGMENT_SIZE, i as u8))
            .unwrap();
    }

    // neighbours in the same block do not overlap
    for (i, address) in fragments.iter().enumerate() {
        let mut buf = vec![0u8; FRAGMENT_SIZE];
        store.read_fragment(*address, 0, &mut buf).unwrap();
        assert_eq!(buf, pattern(FRAGMENT_SIZE, i as u8));
    }

    store.write_fragment_long(fragments[2], 8, 1 << 40).unwrap();
    assert_eq!(store.read_fragment_long(fragments[2], 8).unwrap(), 1 << 40);

    let chars: Vec<u16> = "fragment".encode_utf16().collect();
    store.write_fragment_chars(fragments[3], 100, &chars).unwrap();
    let mut back = vec![0u16; chars.len()];
    store.read_fragment_chars(fragments[3], 100, &mut back).unwrap();
    assert_eq!(back, chars);
}

#[test]
fn test_fragment_boundary_lengths() {
    let (_temp, _db, store) = setup_store("fragment-bounds");
    let address = store.allocate_fragment().unwrap();

    for len in [FRAGMENT_SIZE - 1, FRAGMENT_SIZE] {
        let data = pattern(len, 3);
        store.write_fragment(address, 0, &data).unwrap();
        let mut buf = vec![0u8; len];
        store.read_fragment(address, 0, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    let err = store
        .write_fragment(address, 0, &vec![0u8; FRAGMENT_SIZE + 1])
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}

#[test]
fn test_mini_fragment_round_trips() {
    let (_temp, _db, store) = setup_store("mini-io");
    let a = store.allocate_mini_fragment().unwrap();
    let b = store.allocate_mini_fragment().unwrap();

    store.write_mini_fragment(a, 0, &pattern(MINI_FRAG_SIZE, 1)).unwrap();
    store.write_mini_fragment(b, 0, &pattern(MINI_FRAG_SIZE, 2)).unwrap();

    let mut buf = vec![0u8; MINI_FRAG_SIZE];
    store.read_mini_fragment(a, 0, &mut buf).unwrap();
    assert_eq!(buf, pattern(MINI_FRAG_SIZE, 1));
    store.read_mini_fragment(b, 0, &mut buf).unwrap();
    assert_eq!(buf, pattern(MINI_FRAG_SIZE, 2));

    store.write_mini_fragment_long(b, MINI_FRAG_SIZE - 8, -1).unwrap();
    assert_eq!(store.read_mini_fragment_long(b, MINI_FRAG_SIZE - 8).unwrap(), -1);

    let chars: Vec<u16> = "mini".encode_utf16().collect();
    store.write_mini_fragment_chars(a, 2, &chars).unwrap();
    let mut back = vec![0u16; 4];
    store.read_mini_fragment_chars(a, 2, &mut back).unwrap();
    assert_eq!(back, chars);

    let err = store
        .write_mini_fragment(a, 200, &[0u8; 57])
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidArgument(_)));
}

// =============================================================================
// Corruption Tests
// =============================================================================

#[test]
fn test_address_zero_is_corruption() {
    let (_temp, _db, store) = setup_store("zero-address");
    assert!(!store.is_corrupted());

    let err = store.read_fragment(0, 0, &mut [0u8; 8]).unwrap_err();
    assert!(err.is_corruption());
    assert!(store.is_corrupted());
}

#[test]
fn test_freed_fragment_access_is_corruption() {
    let (_temp, _db, store) = setup_store("freed-fragment");
    let address = store.allocate_fragment().unwrap();
    store.delete_fragment(address).unwrap();

    let err = store.write_fragment(address, 0, b"late").unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_fragment_access_to_row_block_is_corruption() {
    let (_temp, _db, store) = setup_store("wrong-type");
    let row = store.allocate_row().unwrap().address();

    let err = store.read_fragment(row, 0, &mut [0u8; 4]).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_free_block_access_is_corruption() {
    let (_temp, _db, store) = setup_store("free-block");
    let row = store.allocate_row().unwrap().address();
    store.free_block(row).unwrap();

    let err = store.read_block(row, 0, &mut [0u8; 4]).unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn test_corrupted_flag_can_be_cleared() {
    let (_temp, _db, store) = setup_store("flag");
    let _ = store.read_block(0, 0, &mut [0u8; 1]);
    assert!(store.is_corrupted());
    store.set_corrupted(false);
    assert!(!store.is_corrupted());
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_data_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder().data_dir(temp_dir.path()).build();

    let (block, fragment, mini) = {
        let db = Database::open(config.clone()).unwrap();
        let store = db.create_store("persist").unwrap();

        let block = store.allocate_block().unwrap().address();
        let fragment = store.allocate_fragment().unwrap();
        let mini = store.allocate_mini_fragment().unwrap();

        store.write_block(block, 0, b"block data").unwrap();
        store.write_fragment(fragment, 0, b"fragment data").unwrap();
        store.write_mini_fragment(mini, 0, b"mini data").unwrap();

        db.close().unwrap();
        (block, fragment, mini)
    };

    let db = Database::open(config).unwrap();
    let store = db.open_store("persist").unwrap();

    let mut buf = [0u8; 10];
    store.read_block(block, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"block data");

    let mut buf = [0u8; 13];
    store.read_fragment(fragment, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"fragment data");

    let mut buf = [0u8; 9];
    store.read_mini_fragment(mini, 0, &mut buf).unwrap();
    assert_eq!(&buf, b"mini data");
}

#[test]
fn test_flush_writes_without_close() {
    let (temp_dir, db, store) = setup_store("flush");
    let address = store.allocate_block().unwrap().address();
    store.write_block(address, 0, b"flushed").unwrap();
    store.flush().unwrap();
    store.sync().unwrap();

    let raw = std::fs::read(temp_dir.path().join("flush.db")).unwrap();
    let start = address as usize;
    assert_eq!(&raw[start..start + 7], b"flushed");
    drop(db);
}

#[test]
fn test_open_rejects_garbage_file() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(temp_dir.path().join("garbage.db"), vec![0x55u8; 3 * 8192]).unwrap();

    let db = Database::open_path(temp_dir.path()).unwrap();
    assert!(db.open_store("garbage").is_err());
}

#[test]
fn test_create_existing_store_fails() {
    let (_temp, db, _store) = setup_store("exists");
    db.close_store("exists").unwrap();
    assert!(matches!(
        db.create_store("exists"),
        Err(StoreError::IllegalState(_))
    ));
}
