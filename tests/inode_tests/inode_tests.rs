//! Tests for Inode
//!
//! These tests verify:
//! - Byte-exact round trips at every tier and tier boundary
//! - Incremental appends through all four tiers
//! - Tier migrations free the storage they leave behind
//! - remove() releases every unit, tolerating damaged inodes
//! - Blob and clob streams
//! - Inodes saved in and loaded from row blocks

use std::fmt::Write as _;
use std::io::{Read, Write};
use std::sync::Arc;

use blockvault::inode::{BLOCK_MAX, FRAGMENT_MAX, INODE_SIZE, MINI_FRAG_MAX};
use blockvault::store::BLOCK_SIZE;
use blockvault::{BlockStore, Config, Database, Inode, InodeTier, StoreError};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store(name: &str) -> (TempDir, Database, Arc<BlockStore>) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .block_cache_bytes(32 * 1024 * 1024)
        .build();
    let db = Database::open(config).unwrap();
    let store = db.create_store(name).unwrap();
    (temp_dir, db, store)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 7 + i / 251) % 256) as u8).collect()
}

fn read_all(inode: &Inode) -> Vec<u8> {
    let mut buf = vec![0u8; inode.length() as usize];
    let n = inode.read(0, &mut buf).unwrap();
    assert_eq!(n, buf.len());
    buf
}

fn write_blob(db: &Database, store: &Arc<BlockStore>, data: &[u8]) -> Inode {
    let mut inode = Inode::new(Arc::clone(store));
    let mut xa = db.begin();
    inode.append(&mut xa, data).unwrap();
    xa.commit().unwrap();
    inode
}

/// Inode bytes with the given length and every slot zero
fn damaged_inode(store: &Arc<BlockStore>, length: u64) -> Inode {
    let mut bytes = [0u8; INODE_SIZE];
    bytes[..8].copy_from_slice(&length.to_be_bytes());
    Inode::from_bytes(Arc::clone(store), &bytes).unwrap()
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_round_trip_at_tier_boundaries() {
    let (_temp, db, store) = setup_store("boundaries");

    let cases = [
        (0, InodeTier::Inline),
        (1, InodeTier::Inline),
        (119, InodeTier::Inline),
        (120, InodeTier::Inline),
        (121, InodeTier::MiniFragment),
        (256, InodeTier::MiniFragment),
        (257, InodeTier::MiniFragment),
        (3839, InodeTier::MiniFragment),
        (3840, InodeTier::MiniFragment),
        (3841, InodeTier::Fragment),
        (14 * 2048, InodeTier::Fragment),
        (14 * 2048 + 1, InodeTier::Fragment),
        (100_000, InodeTier::Fragment),
    ];

    for (len, tier) in cases {
        let data = pattern(len);
        let inode = write_blob(&db, &store, &data);
        assert_eq!(inode.length(), len as u64);
        assert_eq!(inode.tier(), tier, "length {}", len);
        assert_eq!(read_all(&inode), data, "length {}", len);
    }
}

#[test]
fn test_incremental_append_through_all_tiers() {
    let (_temp, db, store) = setup_store("incremental");
    let target = FRAGMENT_MAX as usize + 3 * BLOCK_SIZE + 123;
    let data = pattern(target);

    let mut inode = Inode::new(Arc::clone(&store));
    let mut seen = vec![InodeTier::Inline];
    let chunks = [1usize, 7, 113, 999, 4096, 33_333, 65_536];

    let mut xa = db.begin();
    let mut written = 0;
    let mut i = 0;
    while written < target {
        let n = chunks[i % chunks.len()].min(target - written);
        inode.append(&mut xa, &data[written..written + n]).unwrap();
        written += n;
        i += 1;

        if seen.last() != Some(&inode.tier()) {
            seen.push(inode.tier());
        }
    }
    xa.commit().unwrap();

    assert_eq!(
        seen,
        vec![
            InodeTier::Inline,
            InodeTier::MiniFragment,
            InodeTier::Fragment,
            InodeTier::Block
        ]
    );
    assert_eq!(inode.length(), target as u64);
    assert_eq!(read_all(&inode), data);
}

#[test]
fn test_read_at_offsets() {
    let (_temp, db, store) = setup_store("offsets");
    let data = pattern(40_000);
    let inode = write_blob(&db, &store, &data);

    // spans the fragment boundary at 2048
    let mut buf = vec![0u8; 100];
    assert_eq!(inode.read(2000, &mut buf).unwrap(), 100);
    assert_eq!(buf, data[2000..2100]);

    // short read at the end
    assert_eq!(inode.read(39_990, &mut buf).unwrap(), 10);
    assert_eq!(buf[..10], data[39_990..]);

    assert_eq!(inode.read(40_000, &mut buf).unwrap(), 0);
    assert_eq!(inode.read(1 << 40, &mut buf).unwrap(), 0);
}

#[test]
fn test_write_to_sink() {
    let (_temp, db, store) = setup_store("write-to");
    let data = pattern(20_000);
    let inode = write_blob(&db, &store, &data);

    let mut out = Vec::new();
    assert_eq!(inode.write_to(&mut out).unwrap(), 20_000);
    assert_eq!(out, data);
}

// =============================================================================
// Tier Storage Tests
// =============================================================================

#[test]
fn test_inline_uses_no_storage() {
    let (_temp, db, store) = setup_store("inline");
    let before = store.counters();
    let inode = write_blob(&db, &store, &pattern(120));

    let after = store.counters();
    assert_eq!(after.block_count, before.block_count);
    assert_eq!(after.fragments_in_use, 0);
    assert_eq!(after.mini_fragments_in_use, 0);
    assert_eq!(&inode.as_bytes()[8..128], &pattern(120)[..]);
}

#[test]
fn test_mini_to_fragment_migration_frees_minis() {
    let (_temp, db, store) = setup_store("migrate");

    let mut inode = write_blob(&db, &store, &pattern(1000));
    assert_eq!(store.counters().mini_fragments_in_use, 4);

    let mut xa = db.begin();
    let more = pattern(5000);
    inode.append(&mut xa, &more[1000..]).unwrap();
    xa.commit().unwrap();

    let counters = store.counters();
    assert_eq!(inode.tier(), InodeTier::Fragment);
    assert_eq!(counters.mini_fragments_in_use, 0);
    assert_eq!(counters.fragments_in_use, 3);
    assert_eq!(read_all(&inode), more);
}

#[test]
fn test_fragment_ceiling_and_block_tier() {
    let (_temp, db, store) = setup_store("ceiling");
    let baseline = store.counters().used_blocks;

    let mut inode = write_blob(&db, &store, &pattern(FRAGMENT_MAX as usize));
    assert_eq!(inode.tier(), InodeTier::Fragment);
    assert_eq!(store.counters().fragments_in_use, 526);
    // one indirect block
    assert_eq!(store.counters().used_blocks, baseline + 1);

    let mut xa = db.begin();
    inode.append(&mut xa, b"x").unwrap();
    xa.commit().unwrap();

    assert_eq!(inode.tier(), InodeTier::Block);
    // fragment prefix stays; one double-indirect block and one data block
    assert_eq!(store.counters().fragments_in_use, 526);
    assert_eq!(store.counters().used_blocks, baseline + 3);

    let mut last = [0u8; 2];
    inode.read(FRAGMENT_MAX - 1, &mut last).unwrap();
    assert_eq!(last, [pattern(FRAGMENT_MAX as usize)[FRAGMENT_MAX as usize - 1], b'x']);
}

#[test]
fn test_append_past_limit_unsupported() {
    let (_temp, db, store) = setup_store("limit");
    let mut inode = damaged_inode(&store, BLOCK_MAX);

    let mut xa = db.begin();
    assert!(matches!(
        inode.append(&mut xa, b"!"),
        Err(StoreError::Unsupported(_))
    ));
    inode.append(&mut xa, b"").unwrap();
    assert_eq!(inode.length(), BLOCK_MAX);
    assert!(!store.is_corrupted());
}

// =============================================================================
// Remove Tests
// =============================================================================

#[test]
fn test_remove_frees_every_tier() {
    let (_temp, db, store) = setup_store("remove");
    let baseline = store.counters();

    for len in [50, 3000, 200_000, FRAGMENT_MAX as usize + 2 * BLOCK_SIZE] {
        let mut inode = write_blob(&db, &store, &pattern(len));
        inode.remove().unwrap();

        assert!(inode.is_empty());
        assert_eq!(inode.tier(), InodeTier::Inline);

        let counters = store.counters();
        assert_eq!(counters.fragments_in_use, 0, "length {}", len);
        assert_eq!(counters.mini_fragments_in_use, 0, "length {}", len);
        assert_eq!(counters.used_blocks, baseline.used_blocks, "length {}", len);
    }
    assert!(!store.is_corrupted());
}

#[test]
fn test_removed_storage_is_reused() {
    let (_temp, db, store) = setup_store("reuse");

    let mut first = write_blob(&db, &store, &pattern(10_000));
    let blocks = store.block_count();
    first.remove().unwrap();

    let second = write_blob(&db, &store, &pattern(10_000));
    assert_eq!(store.block_count(), blocks);
    assert_eq!(read_all(&second), pattern(10_000));
}

#[test]
fn test_remove_tolerates_missing_units() {
    let (_temp, _db, store) = setup_store("damaged-remove");
    let mut inode = damaged_inode(&store, 500);

    inode.remove().unwrap();
    assert!(inode.is_empty());
    assert!(store.is_corrupted());
}

#[test]
fn test_read_of_damaged_inode_is_corruption() {
    let (_temp, _db, store) = setup_store("damaged-read");
    let inode = damaged_inode(&store, MINI_FRAG_MAX);

    let mut buf = [0u8; 16];
    let err = inode.read(0, &mut buf).unwrap_err();
    assert!(err.is_corruption());
    assert!(store.is_corrupted());
}

#[test]
fn test_from_bytes_checks_size() {
    let (_temp, _db, store) = setup_store("from-bytes");
    assert!(matches!(
        Inode::from_bytes(Arc::clone(&store), &[0u8; 64]),
        Err(StoreError::InvalidArgument(_))
    ));
}

// =============================================================================
// Load / Save Tests
// =============================================================================

#[test]
fn test_save_and_load_in_row_block() {
    let (_temp, db, store) = setup_store("row-inode");
    let data = pattern(7000);

    let row = store.allocate_row().unwrap().address();
    let mut inode = Inode::new(Arc::clone(&store));

    let mut xa = db.begin();
    xa.lock_read_and_write(store.lock()).unwrap();
    inode.append(&mut xa, &data).unwrap();
    inode.save(&mut xa, row, INODE_SIZE).unwrap();
    xa.commit().unwrap();

    let loaded = Inode::load(Arc::clone(&store), row, INODE_SIZE).unwrap();
    assert_eq!(loaded.as_bytes(), inode.as_bytes());
    assert_eq!(read_all(&loaded), data);
}

// =============================================================================
// Stream Tests
// =============================================================================

#[test]
fn test_blob_streams() {
    let (_temp, db, store) = setup_store("blob-stream");
    let data = pattern(50_000);

    let mut inode = Inode::new(Arc::clone(&store));
    let mut xa = db.begin();
    {
        let mut out = inode.open_output_stream(&mut xa);
        for chunk in data.chunks(777) {
            out.write_all(chunk).unwrap();
        }
        assert!(out.buffered() < BLOCK_SIZE);
        out.close().unwrap();
    }
    xa.commit().unwrap();
    assert_eq!(inode.length(), 50_000);

    let mut input = inode.open_input_stream();
    let mut back = Vec::new();
    input.read_to_end(&mut back).unwrap();
    assert_eq!(back, data);
    assert_eq!(input.remaining(), 0);
}

#[test]
fn test_output_stream_flushes_on_drop() {
    let (_temp, db, store) = setup_store("stream-drop");

    let mut inode = Inode::new(Arc::clone(&store));
    let mut xa = db.begin();
    {
        let mut out = inode.open_output_stream(&mut xa);
        out.write_all(b"dropped without close").unwrap();
    }
    xa.commit().unwrap();

    assert_eq!(read_all(&inode), b"dropped without close");
}

#[test]
fn test_clob_round_trip() {
    let (_temp, db, store) = setup_store("clob");
    let text = "plain ascii, accents é ü, symbols ✓ and a clef 𝄞 ".repeat(200);

    let mut inode = Inode::new(Arc::clone(&store));
    let mut xa = db.begin();
    {
        let mut writer = inode.open_writer(&mut xa);
        for line in text.split_inclusive(' ') {
            write!(writer, "{}", line).unwrap();
        }
        writer.close().unwrap();
    }
    xa.commit().unwrap();

    let units = text.encode_utf16().count() as u64;
    assert_eq!(inode.char_length(), units);
    assert_eq!(inode.length(), units * 2);
    assert_eq!(inode.read_string().unwrap(), text);

    let mut reader = inode.open_reader();
    let mut head = [0u16; 5];
    assert_eq!(reader.read_chars(&mut head).unwrap(), 5);
    assert_eq!(String::from_utf16(&head).unwrap(), "plain");
    assert_eq!(reader.read_to_string().unwrap(), text[5..]);
}

#[test]
fn test_append_str_stores_utf16_be() {
    let (_temp, db, store) = setup_store("utf16");

    let mut inode = Inode::new(Arc::clone(&store));
    let mut xa = db.begin();
    inode.append_str(&mut xa, "Aé").unwrap();
    xa.commit().unwrap();

    assert_eq!(read_all(&inode), vec![0x00, 0x41, 0x00, 0xE9]);
}
