//! # BlockVault
//!
//! An embedded, file-backed block storage engine with:
//! - Fixed-size block allocation over a single data file per store
//! - A process-wide block cache with asynchronous dirty write-back
//! - Read/write/upgrade locks per logical resource
//! - Lightweight transactions coordinating locks and deferred writes
//! - Tiered blob/clob storage addressed through 128-byte inodes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Database                              │
//! │        (owns the cache, the stores, the tx pool)             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │    Inode    │─────────▶│ Transaction │
//!   │ (blob/clob) │          │ (locks +    │
//!   └──────┬──────┘          │  writes)    │
//!          │                 └──────┬──────┘
//!          ▼                        │
//!   ┌─────────────┐                 │
//!   │ BlockStore  │◀────────────────┘
//!   │ (alloc + IO)│
//!   └──────┬──────┘
//!          │
//!          ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │BlockManager │─────────▶│ Write-back  │
//!   │ (LRU cache) │  channel │   thread    │
//!   └─────────────┘          └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod lock;
pub mod block;
pub mod store;
pub mod transaction;
pub mod inode;
pub mod database;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{StoreError, Result};
pub use config::Config;
pub use database::Database;
pub use block::{BlockHandle, BlockManager};
pub use lock::Lock;
pub use store::{AllocType, BlockStore};
pub use transaction::{Transaction, TransactionPool};
pub use inode::{Inode, InodeTier};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of BlockVault
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
