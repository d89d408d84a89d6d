//! Read/write/upgrade lock over a single monitor.

use std::fmt;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::warn;

use crate::error::{Result, StoreError};

/// Counters guarded by the lock's monitor
#[derive(Debug, Default)]
struct LockState {
    /// Threads holding a read lock (an exclusive holder counts as one)
    readers: u32,

    /// True while a write or exclusive lock is held
    writer: bool,

    /// Threads waiting for an exclusive lock
    try_writers: u32,

    /// Threads waiting to upgrade a held read lock
    try_upgrades: u32,

    /// Last thread to take the write flag, for diagnostics
    owner: Option<Owner>,
}

#[derive(Debug, Clone)]
struct Owner {
    id: ThreadId,
    name: String,
}

impl Owner {
    fn current() -> Self {
        let current = thread::current();
        let name = current
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("{:?}", current.id()));
        Self {
            id: current.id(),
            name,
        }
    }
}

/// Point-in-time view of a lock's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSnapshot {
    pub readers: u32,
    pub writer: bool,
    pub try_writers: u32,
    pub try_upgrades: u32,
    pub owner: Option<String>,
}

/// A named read/write/upgrade lock
///
/// ## Usage:
/// ```text
/// lock_read            ... unlock_read
/// lock_read_and_write  ... unlock_read_and_write
/// lock_read -> lock_write ... unlock_write -> unlock_read
/// ```
///
/// The lock does not track which thread holds a read lock, so unlocks must
/// pair with successful acquires.
pub struct Lock {
    name: String,
    state: Mutex<LockState>,
    cond: Condvar,
}

impl Lock {
    /// Create an unlocked lock identified by `name` in diagnostics
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // =========================================================================
    // Read
    // =========================================================================

    /// Acquire a shared read lock
    ///
    /// Waits while a writer holds the lock or while any thread is waiting to
    /// write or upgrade.
    pub fn lock_read(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        while state.writer || state.try_writers > 0 || state.try_upgrades > 0 {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && (state.writer || state.try_writers > 0 || state.try_upgrades > 0)
            {
                return Err(self.timeout_error(&state, "read", timeout));
            }
        }

        state.readers += 1;
        Ok(())
    }

    pub fn unlock_read(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        self.cond.notify_all();
    }

    /// Acquire a read lock, returning a guard that releases it on drop
    pub fn read(&self, timeout: Duration) -> Result<ReadGuard<'_>> {
        self.lock_read(timeout)?;
        Ok(ReadGuard { lock: self })
    }

    // =========================================================================
    // Exclusive
    // =========================================================================

    /// Acquire the lock exclusively (read and write together)
    pub fn lock_read_and_write(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        state.try_writers += 1;
        while state.readers > 0 || state.writer {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && (state.readers > 0 || state.writer)
            {
                state.try_writers -= 1;
                let err = self.timeout_error(&state, "read-write", timeout);
                // waiting readers may proceed now that this writer gave up
                self.cond.notify_all();
                return Err(err);
            }
        }
        state.try_writers -= 1;

        state.readers += 1;
        state.writer = true;
        state.owner = Some(Owner::current());
        Ok(())
    }

    /// Take the exclusive lock only if it is free right now
    pub fn lock_read_and_write_no_wait(&self) -> bool {
        let mut state = self.state.lock();

        if state.readers > 0 || state.writer {
            return false;
        }

        state.readers += 1;
        state.writer = true;
        state.owner = Some(Owner::current());
        true
    }

    pub fn unlock_read_and_write(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        state.writer = false;
        state.owner = None;
        self.cond.notify_all();
    }

    /// Acquire the exclusive lock, returning a guard that releases it on drop
    pub fn read_and_write(&self, timeout: Duration) -> Result<WriteGuard<'_>> {
        self.lock_read_and_write(timeout)?;
        Ok(WriteGuard { lock: self })
    }

    // =========================================================================
    // Upgrade
    // =========================================================================

    /// Upgrade a read lock held by the caller to a write lock
    ///
    /// The read lock stays held; release with `unlock_write` followed by
    /// `unlock_read`. Two readers upgrading the same lock at once wait on each
    /// other until one of them times out.
    pub fn lock_write(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        if state.readers == 0 {
            return Err(StoreError::IllegalState(format!(
                "{}: write upgrade without a held read lock",
                self.name
            )));
        }

        state.try_upgrades += 1;
        while state.readers > 1 || state.writer {
            if self.cond.wait_until(&mut state, deadline).timed_out()
                && (state.readers > 1 || state.writer)
            {
                state.try_upgrades -= 1;
                let err = self.timeout_error(&state, "write", timeout);
                self.cond.notify_all();
                return Err(err);
            }
        }
        state.try_upgrades -= 1;

        state.writer = true;
        state.owner = Some(Owner::current());
        Ok(())
    }

    /// Drop the write flag taken by `lock_write`, keeping the read lock
    pub fn unlock_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        state.owner = None;
        self.cond.notify_all();
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// Wait until no other thread holds or is acquiring the write flag
    ///
    /// A thread that holds the write flag itself does not wait.
    pub fn wait_for_commit(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let me = thread::current().id();
        let mut state = self.state.lock();

        let busy = |state: &LockState| {
            let owned_by_me = state.owner.as_ref().map(|o| o.id == me).unwrap_or(false);
            !owned_by_me && (state.writer || state.try_writers > 0)
        };

        while busy(&*state) {
            if self.cond.wait_until(&mut state, deadline).timed_out() && busy(&*state) {
                return Err(self.timeout_error(&state, "commit", timeout));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    pub fn snapshot(&self) -> LockSnapshot {
        let state = self.state.lock();
        LockSnapshot {
            readers: state.readers,
            writer: state.writer,
            try_writers: state.try_writers,
            try_upgrades: state.try_upgrades,
            owner: state.owner.as_ref().map(|o| o.name.clone()),
        }
    }

    fn timeout_error(
        &self,
        state: &MutexGuard<'_, LockState>,
        mode: &str,
        timeout: Duration,
    ) -> StoreError {
        let owner = state.owner.as_ref().map(|o| o.name.as_str()).unwrap_or("-");
        warn!(
            lock = %self.name,
            mode,
            owner,
            readers = state.readers,
            writer = state.writer,
            try_writers = state.try_writers,
            try_upgrades = state.try_upgrades,
            "lock timeout"
        );

        StoreError::LockTimeout {
            resource: self.name.clone(),
            timeout_ms: timeout.as_millis() as u64,
            readers: state.readers,
            writer: state.writer,
            try_writers: state.try_writers,
            upgraders: state.try_upgrades,
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let snap = self.snapshot();
        f.debug_struct("Lock")
            .field("name", &self.name)
            .field("readers", &snap.readers)
            .field("writer", &snap.writer)
            .finish()
    }
}

/// Releases a read lock on drop
pub struct ReadGuard<'a> {
    lock: &'a Lock,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

/// Releases an exclusive lock on drop
pub struct WriteGuard<'a> {
    lock: &'a Lock,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read_and_write();
    }
}
