//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while framing or parsing protocol messages.
///
/// Every variant is a protocol fault: the offending peer gets an error reply
/// and the connection keeps going.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Fewer bytes than a frame header.
    #[error("frame too short: expected at least {expected} bytes, got {actual}")]
    FrameTooShort {
        /// Minimum number of bytes required
        expected: usize,
        /// Number of bytes available
        actual: usize,
    },

    /// The SOH/STX marker bytes did not match.
    #[error("invalid frame markers: soh={soh:#04x} stx={stx:#04x}")]
    InvalidMarker {
        /// Byte found where SOH was expected
        soh: u8,
        /// Byte found where STX was expected
        stx: u8,
    },

    /// Payload does not fit in a single inline frame.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge {
        /// Actual payload size
        size: usize,
        /// Maximum allowed
        max: usize,
    },

    /// Fewer payload bytes than the header announced.
    #[error("frame truncated: expected {expected} payload bytes, got {actual}")]
    FrameTruncated {
        /// Announced payload length
        expected: usize,
        /// Bytes actually present
        actual: usize,
    },

    /// A `!longmsg=` header that cannot be honoured.
    #[error("invalid long message: {0}")]
    InvalidLongMessage(String),

    /// Command payload was not valid UTF-8.
    #[error("command is not valid utf-8")]
    InvalidUtf8,

    /// Command name is not part of the protocol.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Command name was recognised but its arguments were not.
    #[error("malformed {command}: {reason}")]
    MalformedCommand {
        /// Command name without the leading `!`
        command: &'static str,
        /// What was wrong
        reason: String,
    },
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::MalformedCommand`].
    pub fn malformed(command: &'static str, reason: impl Into<String>) -> Self {
        Self::MalformedCommand { command, reason: reason.into() }
    }

    /// True for faults detected while decoding frames (as opposed to parsing
    /// the command text inside a frame).
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            Self::FrameTooShort { .. }
                | Self::InvalidMarker { .. }
                | Self::PayloadTooLarge { .. }
                | Self::FrameTruncated { .. }
                | Self::InvalidLongMessage(_)
        )
    }
}
