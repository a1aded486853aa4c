//! Driver error types.
//!
//! Client-caused failures never surface here: they become `!err` replies.
//! What remains are runtime bookkeeping faults (events for connections the
//! driver does not know) and storage failures the driver cannot attribute to a
//! single request.

use std::fmt;

use crate::{registry::ConnId, storage::StorageError};

/// Errors returned by `ServerDriver::process_event`.
#[derive(Debug)]
pub enum DriverError {
    /// Connection not found in registry.
    ///
    /// The runtime delivered an event for a connection the driver already
    /// dropped. Transient - the runtime should forget the connection.
    ConnectionNotFound(ConnId),

    /// Connection already registered.
    ///
    /// The runtime reused a connection id. This is a logic bug - ids should be
    /// unique.
    ConnectionAlreadyExists(ConnId),

    /// Storage operation failed.
    ///
    /// Wraps errors from the storage backend outside any single transfer (for
    /// example removing a deleted group's directory).
    Storage(StorageError),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionNotFound(id) => write!(f, "connection not found: {id}"),
            Self::ConnectionAlreadyExists(id) => write!(f, "connection already exists: {id}"),
            Self::Storage(err) => write!(f, "storage error: {err}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Storage(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StorageError> for DriverError {
    fn from(err: StorageError) -> Self {
        Self::Storage(err)
    }
}
