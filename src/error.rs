//! Error types for the storage engine.

use crate::types::{PageId, TableId, TrxId};
use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the storage engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// I/O error from the underlying file system.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Requested page was not found in its table file.
    #[error("page {0} not found")]
    PageNotFound(PageId),

    /// Value size falls outside `[MIN_VAL_SIZE, MAX_VAL_SIZE]`.
    #[error("value too large: {size} bytes (allowed [{min}, {max}])")]
    ValueSizeOutOfRange {
        size: usize,
        min: usize,
        max: usize,
    },

    /// Data corruption detected (bad magic, checksum mismatch, truncated record).
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// Page bytes do not decode to a well-formed tree page.
    #[error("invalid page: {0}")]
    InvalidPage(String),

    /// Buffer pool has no frame available to satisfy a fetch (every frame pinned).
    #[error("buffer pool exhausted: no available frames")]
    BufferPoolExhausted,

    /// Operation is not valid given the engine's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Key not found for an operation that requires an existing key.
    #[error("key {0} not found")]
    KeyNotFound(i64),

    /// A key being inserted already exists.
    #[error("key {0} already exists")]
    DuplicateKey(i64),

    /// Table file is corrupted or has an invalid header.
    #[error("invalid database file: {0}")]
    InvalidDatabaseFile(String),

    /// Too many tables are already open.
    #[error("cannot open table: at most {0} tables may be open at once")]
    TooManyTables(usize),

    /// No such open table.
    #[error("unknown table id {0}")]
    UnknownTable(TableId),

    /// No such transaction, or the transaction already ended.
    #[error("unknown or already-finished transaction {0}")]
    UnknownTransaction(TrxId),

    /// A lock request was chosen as the victim of deadlock detection; the
    /// owning transaction has been aborted.
    #[error("transaction {0} aborted: deadlock detected")]
    DeadlockAborted(TrxId),

    /// The write-ahead log is in an inconsistent state.
    #[error("log error: {0}")]
    Log(String),
}

impl EngineError {
    pub fn corruption(msg: impl Into<String>) -> Self {
        Self::Corruption(msg.into())
    }

    pub fn invalid_page(msg: impl Into<String>) -> Self {
        Self::InvalidPage(msg.into())
    }

    pub fn invalid_operation(msg: impl Into<String>) -> Self {
        Self::InvalidOperation(msg.into())
    }

    pub fn invalid_db(msg: impl Into<String>) -> Self {
        Self::InvalidDatabaseFile(msg.into())
    }

    pub fn log(msg: impl Into<String>) -> Self {
        Self::Log(msg.into())
    }
}
