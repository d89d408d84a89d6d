//! Tests for Transaction
//!
//! These tests verify:
//! - Lock acquisition is idempotent per lock and released on completion
//! - Deferred upgrades happen at commit
//! - Buffered blocks are written at commit, auto-commit blocks at once
//! - Rollback and rollback-only discard deferred work
//! - Inode removals and block frees run at commit

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use blockvault::store::BLOCK_SIZE;
use blockvault::{BlockStore, Config, Database, Inode, StoreError, Transaction};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_store(name: &str) -> (TempDir, Database, Arc<BlockStore>) {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .lock_timeout_ms(2_000)
        .build();
    let db = Database::open(config).unwrap();
    let store = db.create_store(name).unwrap();
    (temp_dir, db, store)
}

fn file_bytes(temp_dir: &TempDir, name: &str, address: u64, len: usize) -> Vec<u8> {
    let raw = std::fs::read(temp_dir.path().join(format!("{}.db", name))).unwrap();
    let start = address as usize;
    raw[start..start + len].to_vec()
}

// =============================================================================
// Lock Tests
// =============================================================================

#[test]
fn test_lock_read_is_idempotent() {
    let (_temp, db, store) = setup_store("idempotent");
    let mut xa = db.begin();

    xa.lock_read(store.lock()).unwrap();
    xa.lock_read(store.lock()).unwrap();
    assert_eq!(xa.read_lock_count(), 1);
    assert_eq!(store.lock().snapshot().readers, 1);

    xa.commit().unwrap();
    assert_eq!(store.lock().snapshot().readers, 0);
}

#[test]
fn test_lock_write_upgrades_at_commit() {
    let (_temp, db, store) = setup_store("deferred");
    let mut xa = db.begin();

    xa.lock_write(store.lock()).unwrap();
    assert_eq!(xa.pending_upgrade_count(), 1);
    assert_eq!(xa.write_lock_count(), 0);
    assert!(!store.lock().snapshot().writer);

    xa.commit().unwrap();
    let snapshot = store.lock().snapshot();
    assert_eq!(snapshot.readers, 0);
    assert!(!snapshot.writer);
}

#[test]
fn test_lock_read_and_write_upgrades_held_read() {
    let (_temp, db, store) = setup_store("in-place");
    let mut xa = db.begin();

    xa.lock_read(store.lock()).unwrap();
    xa.lock_read_and_write(store.lock()).unwrap();
    assert_eq!(xa.write_lock_count(), 1);

    let snapshot = store.lock().snapshot();
    assert_eq!(snapshot.readers, 1);
    assert!(snapshot.writer);

    xa.rollback().unwrap();
    let snapshot = store.lock().snapshot();
    assert_eq!(snapshot.readers, 0);
    assert!(!snapshot.writer);
}

#[test]
fn test_exclusive_lock_blocks_other_transaction() {
    let (_temp, db, store) = setup_store("contended");
    let db = Arc::new(db);

    let mut xa = db.begin();
    xa.lock_read_and_write(store.lock()).unwrap();

    let other_db = Arc::clone(&db);
    let other_store = Arc::clone(&store);
    let err = thread::spawn(move || {
        let mut other = other_db.begin();
        other.set_timeout(Duration::from_millis(50));
        other.lock_read(other_store.lock()).unwrap_err()
    })
    .join()
    .unwrap();
    assert!(err.is_lock_timeout());

    xa.commit().unwrap();

    let mut later = db.begin();
    later.lock_read(store.lock()).unwrap();
    later.commit().unwrap();
}

#[test]
fn test_no_wait_lock() {
    let (_temp, db, store) = setup_store("no-wait");
    let mut first = db.begin();
    let mut second = db.begin();

    assert!(first.lock_read_and_write_no_wait(store.lock()));
    assert!(first.lock_read_and_write_no_wait(store.lock()));
    assert!(!second.lock_read_and_write_no_wait(store.lock()));

    first.commit().unwrap();
    assert!(second.lock_read_and_write_no_wait(store.lock()));
}

// =============================================================================
// Write Block Tests
// =============================================================================

#[test]
fn test_commit_writes_buffered_blocks() {
    let (temp_dir, db, store) = setup_store("buffered");
    let address = store.allocate_row().unwrap().address();
    store.flush().unwrap();

    let mut xa = db.begin();
    xa.lock_read_and_write(store.lock()).unwrap();
    let block = store.write_block(address, 0, b"committed").unwrap();
    xa.add_update_block(block).unwrap();
    assert_eq!(xa.write_block_count(), 1);

    assert_eq!(file_bytes(&temp_dir, "buffered", address, 9), vec![0u8; 9]);
    xa.commit().unwrap();
    assert_eq!(file_bytes(&temp_dir, "buffered", address, 9), b"committed");
}

#[test]
fn test_auto_commit_writes_immediately() {
    let (temp_dir, db, store) = setup_store("auto");
    let address = store.allocate_row().unwrap().address();

    let mut xa = db.begin_auto_commit();
    assert!(xa.is_auto_commit());
    let block = store.write_block(address, 16, b"now").unwrap();
    xa.add_update_block(block).unwrap();

    assert_eq!(file_bytes(&temp_dir, "auto", address + 16, 3), b"now");
    xa.commit().unwrap();
}

#[test]
fn test_auto_commit_does_not_pin_blocks() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .data_dir(temp_dir.path())
        .block_cache_bytes(1024 * 1024)
        .build();
    let db = Database::open(config).unwrap();
    let store = db.create_store("unpinned").unwrap();
    let capacity = db.manager().capacity();
    assert_eq!(capacity, 128);

    let data: Vec<u8> = (0..8 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    let mut inode = Inode::new(Arc::clone(&store));

    let mut xa = db.begin_auto_commit();
    inode.append(&mut xa, &data).unwrap();

    // every touched block is registered, none is held
    assert!(xa.write_block_count() > capacity);
    assert!(db.manager().stats().cached_blocks <= capacity);
    xa.commit().unwrap();

    let mut back = vec![0u8; data.len()];
    assert_eq!(inode.read(0, &mut back).unwrap(), data.len());
    assert!(back == data, "blob differs after eviction");
}

#[test]
fn test_rollback_discards_buffered_writes() {
    let (temp_dir, db, store) = setup_store("rollback");
    let address = store.allocate_row().unwrap().address();
    store.flush().unwrap();

    let mut xa = db.begin();
    xa.lock_read_and_write(store.lock()).unwrap();
    let block = store.write_block(address, 0, b"discard").unwrap();
    xa.create_write_block(block).unwrap();
    xa.rollback().unwrap();

    assert_eq!(file_bytes(&temp_dir, "rollback", address, 7), vec![0u8; 7]);
    assert_eq!(store.lock().snapshot().readers, 0);
}

#[test]
fn test_commit_without_flush_on_commit_leaves_disk() {
    let (temp_dir, db, store) = setup_store("no-flush");
    let address = store.allocate_row().unwrap().address();
    store.flush().unwrap();
    store.set_flush_on_commit(false);

    let mut xa = db.begin();
    let block = store.write_block(address, 0, b"later").unwrap();
    xa.add_update_block(block).unwrap();
    xa.commit().unwrap();
    assert_eq!(file_bytes(&temp_dir, "no-flush", address, 5), vec![0u8; 5]);

    store.flush().unwrap();
    assert_eq!(file_bytes(&temp_dir, "no-flush", address, 5), b"later");
}

// =============================================================================
// Rollback-Only Tests
// =============================================================================

#[test]
fn test_rollback_only_releases_and_rejects() {
    let (_temp, db, store) = setup_store("rollback-only");
    let mut xa = db.begin();
    xa.lock_read_and_write(store.lock()).unwrap();

    xa.set_rollback_only();
    assert!(xa.is_rollback_only());
    assert_eq!(store.lock().snapshot().readers, 0);

    assert!(matches!(
        xa.lock_read(store.lock()),
        Err(StoreError::IllegalState(_))
    ));
    assert!(matches!(xa.commit(), Err(StoreError::RollbackOnly)));
}

#[test]
fn test_drop_rolls_back() {
    let (_temp, db, store) = setup_store("dropped");
    {
        let mut xa = db.begin();
        xa.lock_read(store.lock()).unwrap();
        xa.lock_write(store.lock()).unwrap();
    }
    let snapshot = store.lock().snapshot();
    assert_eq!(snapshot.readers, 0);
    assert!(!snapshot.writer);
}

#[test]
fn test_standalone_transaction() {
    let (_temp, _db, store) = setup_store("standalone");
    let mut xa = Transaction::new(Duration::from_secs(1));
    xa.lock_read(store.lock()).unwrap();
    assert_eq!(xa.id(), 0);
    xa.commit().unwrap();
    assert_eq!(store.lock().snapshot().readers, 0);
}

// =============================================================================
// Deferred Free Tests
// =============================================================================

#[test]
fn test_delete_inode_at_commit() {
    let (_temp, db, store) = setup_store("delete-inode");

    let mut inode = Inode::new(Arc::clone(&store));
    let mut setup = db.begin();
    inode.append(&mut setup, &vec![7u8; 5000]).unwrap();
    setup.commit().unwrap();
    assert_eq!(store.counters().fragments_in_use, 3);

    let mut xa = db.begin();
    xa.lock_read_and_write(store.lock()).unwrap();
    xa.delete_inode(inode.clone());
    assert_eq!(store.counters().fragments_in_use, 3);
    xa.commit().unwrap();
    assert_eq!(store.counters().fragments_in_use, 0);
}

#[test]
fn test_delete_inode_skipped_on_rollback() {
    let (_temp, db, store) = setup_store("keep-inode");

    let mut inode = Inode::new(Arc::clone(&store));
    let mut setup = db.begin();
    inode.append(&mut setup, &vec![1u8; 1000]).unwrap();
    setup.commit().unwrap();
    let minis = store.counters().mini_fragments_in_use;
    assert_eq!(minis, 4);

    let mut xa = db.begin();
    xa.delete_inode(inode.clone());
    xa.rollback().unwrap();
    assert_eq!(store.counters().mini_fragments_in_use, minis);
}

#[test]
fn test_add_inode_removed_on_rollback() {
    let (_temp, db, store) = setup_store("add-inode");

    let mut xa = db.begin();
    let mut inode = Inode::new(Arc::clone(&store));
    inode.append(&mut xa, &vec![9u8; 600]).unwrap();
    xa.add_inode(inode.clone());
    assert_eq!(store.counters().mini_fragments_in_use, 3);

    xa.rollback().unwrap();
    assert_eq!(store.counters().mini_fragments_in_use, 0);
}

#[test]
fn test_add_inode_kept_on_commit() {
    let (_temp, db, store) = setup_store("add-commit");

    let mut xa = db.begin();
    let mut inode = Inode::new(Arc::clone(&store));
    inode.append(&mut xa, &vec![9u8; 600]).unwrap();
    xa.add_inode(inode.clone());
    xa.commit().unwrap();

    assert_eq!(store.counters().mini_fragments_in_use, 3);
}

#[test]
fn test_deallocate_block_at_commit() {
    let (_temp, db, store) = setup_store("deallocate");
    let address = store.allocate_row().unwrap().address();

    let mut xa = db.begin();
    xa.deallocate_block(&store, address);
    assert_eq!(store.counters().row_blocks, 1);
    xa.commit().unwrap();
    assert_eq!(store.counters().row_blocks, 0);

    let mut xa = db.begin();
    xa.deallocate_block(&store, address);
    assert!(matches!(xa.commit(), Err(StoreError::DoubleFree { .. })));
}

// =============================================================================
// Pool Tests
// =============================================================================

#[test]
fn test_pool_reuses_buffers() {
    let (_temp, db, _store) = setup_store("pool");
    assert_eq!(db.pool().idle_count(), 0);

    let first = db.begin();
    let first_id = first.id();
    first.commit().unwrap();
    assert_eq!(db.pool().idle_count(), 1);

    let second = db.begin();
    assert!(second.id() > first_id);
    assert_eq!(db.pool().idle_count(), 0);
    drop(second);
    assert_eq!(db.pool().idle_count(), 1);

    assert_eq!(BLOCK_SIZE, 8192);
}
