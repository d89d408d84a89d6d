//! Reuse of transaction buffers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::transaction::TxBuffers;
use super::Transaction;

/// Hands out transactions and takes back their cleared buffers
pub struct TransactionPool {
    idle: Mutex<Vec<TxBuffers>>,
    max_idle: usize,
    next_id: AtomicU64,
    timeout: Duration,
}

impl TransactionPool {
    /// Pool keeping up to `max_idle` buffers; transactions use `timeout`
    /// for lock acquisition and block commits
    pub fn new(max_idle: usize, timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            max_idle,
            next_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Start a multi-operation transaction
    pub fn begin(self: &Arc<Self>) -> Transaction {
        self.start(false)
    }

    /// Start a transaction whose write blocks are written as they register
    pub fn begin_auto_commit(self: &Arc<Self>) -> Transaction {
        self.start(true)
    }

    /// Buffers waiting for reuse
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn start(self: &Arc<Self>, auto_commit: bool) -> Transaction {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let buffers = self.idle.lock().pop().unwrap_or_default();
        Transaction::with_buffers(id, self.timeout, auto_commit, buffers, Some(Arc::clone(self)))
    }

    pub(crate) fn recycle(&self, buffers: TxBuffers) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buffers);
        }
    }
}

impl std::fmt::Debug for TransactionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionPool")
            .field("idle", &self.idle_count())
            .field("max_idle", &self.max_idle)
            .finish()
    }
}
