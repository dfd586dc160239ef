//! Error types for MartenDB.

use crate::page::PageId;
use thiserror::Error;

/// Result type alias using MartenError.
pub type Result<T> = std::result::Result<T, MartenError>;

/// Errors that can occur in MartenDB operations.
#[derive(Debug, Error)]
pub enum MartenError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // File factory errors
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileAlreadyExists(String),

    #[error("File handle {0} is not open")]
    FileNotOpen(u32),

    // Paging errors
    #[error("Page not found: {page_id}")]
    PageNotFound { page_id: PageId },

    #[error("Buffer pool full, unable to allocate frame")]
    BufferPoolFull,

    #[error("Page pinned: {page_id}")]
    PagePinned { page_id: PageId },

    #[error("Bad buffer: page is not resident in the pool")]
    BadBuffer,

    // Heap errors
    #[error("Page full, unable to insert record")]
    PageFull,

    #[error("Record size mismatch: expected {expected}, got {actual}")]
    RecordSizeMismatch { expected: usize, actual: usize },

    // B+ tree index errors
    #[error("Key {key} is reserved and cannot be indexed")]
    KeyOutOfRange { key: i32 },

    #[error("Invalid index meta: {0}")]
    InvalidIndexMeta(String),

    #[error("Bad scan opcodes")]
    BadOpcodes,

    #[error("Bad scan range: low bound exceeds high bound")]
    BadScanRange,

    #[error("No such key found in the scan range")]
    NoSuchKeyFound,

    #[error("Scan not initialized")]
    ScanNotInitialized,

    #[error("Index scan completed")]
    IndexScanCompleted,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}
