//! Runtime errors surfaced by [`Server`](crate::Server).

use thiserror::Error;

use crate::storage::StorageError;

/// Errors that stop the server from starting or running.
///
/// Per-connection failures never reach this type; the driver turns them into
/// closed connections and log lines.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Unusable configuration value, such as an unparsable bind address
    #[error("configuration error: {0}")]
    Config(String),

    /// Listener failure (bind, accept, local address)
    #[error("transport error: {0}")]
    Transport(String),

    /// Storage root could not be prepared
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}
