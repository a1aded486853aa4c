//! Wire frame codec.
//!
//! Every logical message travels as a `Frame`:
//!
//! ```text
//! +-----+----------------+-----+-------------------+
//! | SOH | length (u16 BE)| STX | payload           |
//! +-----+----------------+-----+-------------------+
//! ```
//!
//! Messages longer than [`LONG_MESSAGE_THRESHOLD`] do not fit the inline
//! budget. They are sent as one frame carrying `!longmsg=<N> <head>` followed
//! by the remaining `N - head.len()` bytes *without* framing. The receiver
//! collects those raw bytes and hands the reassembled message upward as if it
//! had arrived in one piece.

use bytes::{BufMut, Bytes};

use crate::errors::{ProtocolError, Result};

/// Start-of-header marker.
pub const SOH: u8 = 0x01;

/// Start-of-text marker.
pub const STX: u8 = 0x02;

/// Largest message sent inline. Anything longer uses the long-message form.
pub const LONG_MESSAGE_THRESHOLD: usize = 4096;

/// Upper bound for a reassembled long message (1 MiB).
pub const MAX_LONG_MESSAGE_SIZE: usize = 1024 * 1024;

/// Control prefix announcing a long message.
pub const LONG_MESSAGE_PREFIX: &[u8] = b"!longmsg=";

/// Fixed 4-byte frame header.
///
/// # Invariants
///
/// - Byte 0 is [`SOH`], byte 3 is [`STX`]. [`FrameHeader::from_bytes`] rejects
///   anything else.
/// - The length is stored big endian in bytes 1..3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    payload_len: u16,
}

impl FrameHeader {
    /// Size of the serialized header.
    pub const SIZE: usize = 4;

    /// Maximum payload a single frame can announce.
    pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

    /// Header announcing `payload_len` bytes.
    #[must_use]
    pub fn new(payload_len: u16) -> Self {
        Self { payload_len }
    }

    /// Announced payload length.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        usize::from(self.payload_len)
    }

    /// Serialize to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let [hi, lo] = self.payload_len.to_be_bytes();
        [SOH, hi, lo, STX]
    }

    /// Parse a header from the first [`FrameHeader::SIZE`] bytes.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::FrameTooShort` if fewer than 4 bytes are given
    /// - `ProtocolError::InvalidMarker` if SOH or STX is wrong
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let Some(&[soh, hi, lo, stx]) = bytes.first_chunk::<{ Self::SIZE }>() else {
            return Err(ProtocolError::FrameTooShort { expected: Self::SIZE, actual: bytes.len() });
        };

        if soh != SOH || stx != STX {
            return Err(ProtocolError::InvalidMarker { soh, stx });
        }

        Ok(Self { payload_len: u16::from_be_bytes([hi, lo]) })
    }
}

/// One framed message.
///
/// # Invariants
///
/// - `payload.len()` never exceeds [`FrameHeader::MAX_PAYLOAD_SIZE`] once
///   encoded. [`Frame::encode`] is the enforcement point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Raw payload bytes (command text)
    pub payload: Bytes,
}

impl Frame {
    /// Wrap a payload.
    #[must_use]
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self { payload: payload.into() }
    }

    /// Header matching this frame's payload.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if the payload exceeds the u16 range
    pub fn header(&self) -> Result<FrameHeader> {
        let len = u16::try_from(self.payload.len()).map_err(|_| {
            ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: FrameHeader::MAX_PAYLOAD_SIZE,
            }
        })?;
        Ok(FrameHeader::new(len))
    }

    /// Encode into `dst` as `[header] + [payload]`.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::PayloadTooLarge` if the payload exceeds the u16 range
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        let header = self.header()?;
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Decode one frame from the start of `bytes`. Trailing data is ignored.
    ///
    /// # Errors
    ///
    /// - Header errors from [`FrameHeader::from_bytes`]
    /// - `ProtocolError::FrameTruncated` if the payload is incomplete
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::from_bytes(bytes)?;
        let end = FrameHeader::SIZE + header.payload_len();

        let payload = bytes.get(FrameHeader::SIZE..end).ok_or(ProtocolError::FrameTruncated {
            expected: header.payload_len(),
            actual: bytes.len().saturating_sub(FrameHeader::SIZE),
        })?;

        Ok(Self { payload: Bytes::copy_from_slice(payload) })
    }
}

/// Encode one logical message, choosing inline or long-message form.
///
/// Inline messages produce exactly one frame. Long messages produce one frame
/// holding `!longmsg=<N> <head>` followed by the raw tail, where `N` is the
/// full message length and `head` fills the rest of the inline budget.
///
/// # Errors
///
/// - `ProtocolError::InvalidLongMessage` if the message exceeds
///   [`MAX_LONG_MESSAGE_SIZE`]
pub fn encode_message(message: &[u8], dst: &mut impl BufMut) -> Result<()> {
    if message.len() <= LONG_MESSAGE_THRESHOLD {
        return Frame::new(Bytes::copy_from_slice(message)).encode(dst);
    }

    if message.len() > MAX_LONG_MESSAGE_SIZE {
        return Err(ProtocolError::InvalidLongMessage(format!(
            "{} bytes exceeds the {MAX_LONG_MESSAGE_SIZE} byte limit",
            message.len()
        )));
    }

    let prefix = format!("!longmsg={} ", message.len());
    let head_len = LONG_MESSAGE_THRESHOLD - prefix.len();
    let (head, tail) = message.split_at(head_len);

    let mut payload = Vec::with_capacity(LONG_MESSAGE_THRESHOLD);
    payload.extend_from_slice(prefix.as_bytes());
    payload.extend_from_slice(head);

    Frame::new(payload).encode(dst)?;
    dst.put_slice(tail);
    Ok(())
}

/// Parsed `!longmsg=<N> <head>` control payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LongMessageHeader {
    /// Full logical message length
    pub total: usize,
    /// Leading bytes of the logical message carried in the control frame
    pub head: Bytes,
}

impl LongMessageHeader {
    /// Bytes still expected after the head.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.total - self.head.len()
    }

    /// Recognise a long-message control payload.
    ///
    /// Returns `Ok(None)` for ordinary payloads.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidLongMessage` if the length is missing, not a
    ///   number, shorter than the head, or above [`MAX_LONG_MESSAGE_SIZE`]
    pub fn parse(payload: &Bytes) -> Result<Option<Self>> {
        let Some(rest) = payload.strip_prefix(LONG_MESSAGE_PREFIX) else {
            return Ok(None);
        };

        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| ProtocolError::InvalidLongMessage("missing separator".to_string()))?;

        let total: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| ProtocolError::InvalidLongMessage("length is not a number".to_string()))?;

        if total > MAX_LONG_MESSAGE_SIZE {
            return Err(ProtocolError::InvalidLongMessage(format!(
                "{total} bytes exceeds the {MAX_LONG_MESSAGE_SIZE} byte limit"
            )));
        }

        let head_start = LONG_MESSAGE_PREFIX.len() + space + 1;
        let head = payload.slice(head_start..);
        if head.len() > total {
            return Err(ProtocolError::InvalidLongMessage(format!(
                "head of {} bytes exceeds announced length {total}",
                head.len()
            )));
        }

        Ok(Some(Self { total, head }))
    }
}
