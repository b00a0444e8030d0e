//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("buffer pool exhausted: all frames are pinned")]
    PoolExhausted,

    #[error("page {0} does not exist on disk")]
    PageNotOnDisk(PageId),

    #[error("page is full: requires {required} bytes but only {available} available")]
    PageFull { required: usize, available: usize },

    #[error("key of {0} bytes exceeds the maximum a page can hold")]
    KeyTooLarge(usize),

    #[error("index {0:?} is not registered in the header page")]
    UnknownIndex(String),

    #[error("index {0:?} is already registered in the header page")]
    IndexAlreadyRegistered(String),

    #[error("header page is full: cannot register another index")]
    HeaderFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
