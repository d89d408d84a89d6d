//! Lock Module
//!
//! Per-resource read / write / upgrade synchronization.
//!
//! ## Responsibilities
//! - Shared read locks for block and row readers
//! - Exclusive read+write locks for writers
//! - Upgrading a held read lock to a write lock without releasing it
//! - Bounded waits: every acquire takes a timeout and fails with
//!   `StoreError::LockTimeout` instead of hanging
//!
//! ## Fairness
//! ```text
//!   new reader   waits while: writer || try_writers > 0 || try_upgrades > 0
//!   exclusive    waits while: readers > 0 || writer
//!   upgrade      waits while: readers > 1 || writer
//! ```
//! Writers and upgraders announce themselves through the `try_*` counters
//! before waiting, so a steady stream of new readers cannot starve them.

mod rw_lock;

pub use rw_lock::{Lock, LockSnapshot, ReadGuard, WriteGuard};
