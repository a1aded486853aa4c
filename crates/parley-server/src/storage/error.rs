//! Storage error types.
//!
//! - `NotFound`: requested group file doesn't exist
//! - `InvalidName`: a group or file name would escape its directory
//! - `NamesExhausted`: every de-duplicated candidate name is taken
//! - `Io`: underlying file system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// File not found
    #[error("file not found: {group}/{filename}")]
    NotFound {
        /// Group directory searched
        group: String,
        /// File name that was not found
        filename: String,
    },

    /// Name contains path separators or is otherwise unusable on disk
    #[error("invalid storage name: {0:?}")]
    InvalidName(String),

    /// No free de-duplicated name was found
    #[error("no free name for {0}")]
    NamesExhausted(String),

    /// I/O error (file system)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
