//! Error types for BlockVault
//!
//! Provides a unified error type for all store operations.

use thiserror::Error;

/// Result type alias using StoreError
pub type Result<T> = std::result::Result<T, StoreError>;

/// Unified error type for BlockVault operations
#[derive(Debug, Error)]
pub enum StoreError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Store State Errors
    // -------------------------------------------------------------------------
    /// A referenced address is zero, negative or outside the store.
    /// Raising this always flags the owning store as corrupted.
    #[error("Store {store} is corrupted: {detail}")]
    Corruption { store: String, detail: String },

    #[error("{store} double free of 0x{address:x}")]
    DoubleFree { store: String, address: u64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Invalid store format: {0}")]
    Format(String),

    // -------------------------------------------------------------------------
    // Concurrency Errors
    // -------------------------------------------------------------------------
    #[error(
        "Lock timeout on {resource} after {timeout_ms}ms \
         (readers={readers}, writer={writer}, try_writers={try_writers}, upgraders={upgraders})"
    )]
    LockTimeout {
        resource: String,
        timeout_ms: u64,
        readers: u32,
        writer: bool,
        try_writers: u32,
        upgraders: u32,
    },

    #[error("Transaction is marked rollback-only")]
    RollbackOnly,

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StoreError {
    /// True for lock acquisition timeouts
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }

    /// True for corruption detected in a store
    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption { .. })
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Lets the blob streams implement `std::io::Read` / `std::io::Write`.
impl From<StoreError> for std::io::Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Io(inner) => inner,
            StoreError::LockTimeout { .. } => {
                std::io::Error::new(std::io::ErrorKind::TimedOut, e.to_string())
            }
            StoreError::InvalidArgument(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
            }
            StoreError::Corruption { .. } | StoreError::Format(_) => {
                std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        }
    }
}
