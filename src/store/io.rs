//! Store File I/O
//!
//! Positional reads and writes against one store file, with a small pool of
//! reusable handles and a permit count that throttles concurrent
//! non-priority operations.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{Result, StoreError};

/// I/O driver for one store file
///
/// ## Concurrency:
/// - `handles`: pooled `File`s; an operation takes one out and puts it back
/// - `permits`: non-priority operations wait here; priority writes
///   (allocation table, block zeroing on extend) skip the wait
/// - counters and flags are atomics
pub struct StoreIo {
    name: String,
    path: PathBuf,
    store_id: u64,

    handles: Mutex<Vec<File>>,
    handle_pool: usize,

    permits: Mutex<usize>,
    permit_cond: Condvar,

    file_size: AtomicU64,
    flush_on_commit: AtomicBool,
    closed: AtomicBool,

    blocks_read: AtomicU64,
    blocks_written: AtomicU64,
}

impl StoreIo {
    /// Create a new, empty store file. Fails if the path already exists.
    pub fn create(name: &str, path: &Path, store_id: u64, config: &Config) -> Result<Self> {
        if path.exists() {
            return Err(StoreError::IllegalState(format!(
                "{}: can't create store file '{}' because it already exists",
                name,
                path.display()
            )));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        debug!(store = name, path = %path.display(), "created store file");
        Ok(Self::with_file(name, path, store_id, file, 0, config))
    }

    /// Open an existing store file
    pub fn open(name: &str, path: &Path, store_id: u64, config: &Config) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();

        debug!(store = name, path = %path.display(), len, "opened store file");
        Ok(Self::with_file(name, path, store_id, file, len, config))
    }

    fn with_file(
        name: &str,
        path: &Path,
        store_id: u64,
        file: File,
        len: u64,
        config: &Config,
    ) -> Self {
        Self {
            name: name.to_string(),
            path: path.to_path_buf(),
            store_id,
            handles: Mutex::new(vec![file]),
            handle_pool: config.file_handle_pool.max(1),
            permits: Mutex::new(config.io_permits),
            permit_cond: Condvar::new(),
            file_size: AtomicU64::new(len),
            flush_on_commit: AtomicBool::new(config.flush_dirty_blocks_on_commit),
            closed: AtomicBool::new(false),
            blocks_read: AtomicU64::new(0),
            blocks_written: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    /// Current length of the file in bytes
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::SeqCst)
    }

    pub fn flush_on_commit(&self) -> bool {
        self.flush_on_commit.load(Ordering::SeqCst)
    }

    pub fn set_flush_on_commit(&self, flush: bool) {
        self.flush_on_commit.store(flush, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Blocks read from disk since open
    pub fn blocks_read(&self) -> u64 {
        self.blocks_read.load(Ordering::Relaxed)
    }

    /// Block writes issued since open
    pub fn blocks_written(&self) -> u64 {
        self.blocks_written.load(Ordering::Relaxed)
    }

    // =========================================================================
    // Positional I/O
    // =========================================================================

    /// Read `buf.len()` bytes at `address`
    pub fn read_at(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let end = address + buf.len() as u64;
        let size = self.file_size();
        if end > size {
            return Err(StoreError::IllegalState(format!(
                "{}: read of 0x{:x}..0x{:x} beyond file size 0x{:x}",
                self.name, address, end, size
            )));
        }

        trace!(store = %self.name, address, len = buf.len(), "read");
        self.with_handle(false, |file| file.read_exact_at(buf, address))?;
        self.blocks_read.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write `buf` at `address`, growing the file if needed
    ///
    /// `priority` writes skip the permit queue.
    pub fn write_at(&self, address: u64, buf: &[u8], priority: bool) -> Result<()> {
        trace!(store = %self.name, address, len = buf.len(), priority, "write");
        self.with_handle(priority, |file| file.write_all_at(buf, address))?;

        self.file_size
            .fetch_max(address + buf.len() as u64, Ordering::SeqCst);
        self.blocks_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// fsync the file
    pub fn sync(&self) -> Result<()> {
        self.with_handle(true, |file| file.sync_all())
    }

    /// Drop every pooled handle. Later operations fail.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handles.lock().clear();
        self.permit_cond.notify_all();
        debug!(store = %self.name, "closed store file");
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn with_handle<R>(
        &self,
        priority: bool,
        op: impl FnOnce(&File) -> std::io::Result<R>,
    ) -> Result<R> {
        if self.is_closed() {
            return Err(StoreError::IllegalState(format!(
                "{}: store file is closed",
                self.name
            )));
        }

        if !priority {
            self.acquire_permit()?;
        }

        let result = self.take_handle().and_then(|file| {
            let result = op(&file).map_err(StoreError::from);
            self.put_handle(file);
            result
        });

        if !priority {
            self.release_permit();
        }

        result
    }

    fn acquire_permit(&self) -> Result<()> {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            if self.is_closed() {
                return Err(StoreError::IllegalState(format!(
                    "{}: store file is closed",
                    self.name
                )));
            }
            self.permit_cond.wait(&mut permits);
        }
        *permits -= 1;
        Ok(())
    }

    fn release_permit(&self) {
        *self.permits.lock() += 1;
        self.permit_cond.notify_one();
    }

    fn take_handle(&self) -> Result<File> {
        if let Some(file) = self.handles.lock().pop() {
            return Ok(file);
        }

        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        Ok(file)
    }

    fn put_handle(&self, file: File) {
        if self.is_closed() {
            return;
        }
        let mut handles = self.handles.lock();
        if handles.len() < self.handle_pool {
            handles.push(file);
        }
    }
}

impl std::fmt::Debug for StoreIo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreIo")
            .field("name", &self.name)
            .field("store_id", &self.store_id)
            .field("file_size", &self.file_size())
            .finish()
    }
}
