//! Error types for framed connections.
//!
//! Protocol faults (bad markers, bad long-message headers) are kept apart from
//! transport faults so the server can answer the former and drop on the
//! latter.

use std::io;

use parley_proto::ProtocolError;
use thiserror::Error;

/// Errors raised by [`crate::connection::Connection`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// A send was attempted while another is still pending
    #[error("a send is already pending on this connection")]
    Busy,

    /// The peer closed the stream
    #[error("connection closed by peer")]
    Closed,

    /// Underlying transport error
    #[error("transport error: {0}")]
    Io(String),

    /// Bytes on the wire violated the framing protocol
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

impl ConnectionError {
    /// True if the connection can keep going after reporting this error.
    ///
    /// Protocol faults reset the inbound state and are answered; everything
    /// else means the connection is unusable.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::Busy)
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::Io(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_faults_are_recoverable() {
        let err = ConnectionError::from(ProtocolError::InvalidMarker { soh: 0, stx: 0 });
        assert!(err.is_recoverable());
        assert!(ConnectionError::Busy.is_recoverable());
    }

    #[test]
    fn transport_faults_are_fatal() {
        assert!(!ConnectionError::Closed.is_recoverable());
        assert!(!ConnectionError::Io("boom".to_string()).is_recoverable());
    }

    #[test]
    fn reset_maps_to_closed() {
        let err = ConnectionError::from(io::Error::from(io::ErrorKind::ConnectionReset));
        assert_eq!(err, ConnectionError::Closed);

        let err = ConnectionError::from(io::Error::other("disk on fire"));
        assert!(matches!(err, ConnectionError::Io(_)));
    }
}
