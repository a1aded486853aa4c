//! Framed connection with partial-I/O continuation.
//!
//! A [`Connection`] owns a non-blocking [`Socket`] and moves at most one
//! logical message per call in each direction. When the socket cannot take or
//! deliver everything at once, the remainder is parked in a
//! [`PendingMessage`] and the next call picks up where the last one stopped.
//!
//! # Receive stages
//!
//! ```text
//! ┌────────┐ 4 bytes ┌─────────┐ len bytes  ┌─────────┐
//! │ Header │────────>│ Payload │───────────>│ message │
//! └────────┘         └─────────┘            └─────────┘
//!                         │ !longmsg=N            ^
//!                         ↓                       │
//!                    ┌──────────┐  N - head bytes │
//!                    │ LongBody │─────────────────┘
//!                    └──────────┘
//! ```
//!
//! Reads never ask the socket for more than the current stage needs, so the
//! bytes following a frame (another frame, or raw transfer data after a
//! channel registration) stay in the socket.

use std::io;

use bytes::Bytes;
use parley_proto::{FrameHeader, LongMessageHeader, encode_message};

use crate::error::ConnectionError;

/// Result alias for connection operations.
pub type Result<T> = std::result::Result<T, ConnectionError>;

/// Non-blocking byte stream.
///
/// Both methods follow `std::io` conventions: `Ok(0)` from `try_read` is end
/// of stream, `ErrorKind::WouldBlock` means not ready.
pub trait Socket: Send + 'static {
    /// Read into `buf` without blocking.
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write from `buf` without blocking.
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize>;
}

/// Direction of a parked transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingOp {
    /// Outbound bytes not yet accepted by the socket
    Sending,
    /// Inbound bytes not yet delivered by the socket
    Receiving,
}

/// Continuation for a partially completed send or receive.
///
/// # Invariants
///
/// - `moved <= total`
/// - `buffer.len() == total`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    op: PendingOp,
    buffer: Vec<u8>,
    total: usize,
    moved: usize,
}

impl PendingMessage {
    /// Outbound continuation for fully encoded wire bytes.
    #[must_use]
    pub fn sending(wire: Vec<u8>) -> Self {
        let total = wire.len();
        Self { op: PendingOp::Sending, buffer: wire, total, moved: 0 }
    }

    /// Inbound continuation expecting `total` bytes.
    #[must_use]
    pub fn receiving(total: usize) -> Self {
        Self { op: PendingOp::Receiving, buffer: vec![0; total], total, moved: 0 }
    }

    /// Direction of this continuation.
    #[must_use]
    pub fn op(&self) -> PendingOp {
        self.op
    }

    /// Total bytes this operation moves.
    #[must_use]
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bytes moved so far.
    #[must_use]
    pub fn moved(&self) -> usize {
        self.moved
    }

    /// Bytes still to move.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.total - self.moved
    }

    /// True once every byte has moved.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.moved == self.total
    }

    fn into_bytes(self) -> Bytes {
        Bytes::from(self.buffer)
    }
}

/// Outcome of a send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Every byte reached the socket
    Complete,
    /// The socket stopped accepting; call [`Connection::flush`] on write
    /// readiness
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReceiveStage {
    Header,
    Payload,
    LongBody,
}

#[derive(Debug)]
struct Inbound {
    stage: ReceiveStage,
    pending: PendingMessage,
}

impl Inbound {
    fn header() -> Self {
        Self { stage: ReceiveStage::Header, pending: PendingMessage::receiving(FrameHeader::SIZE) }
    }
}

/// Framed connection over a non-blocking socket.
///
/// At most one send and one receive can be pending. A second
/// [`Connection::send_message`] while a send is parked fails with
/// [`ConnectionError::Busy`]; callers queue above this layer.
#[derive(Debug)]
pub struct Connection<S> {
    socket: S,
    outbound: Option<PendingMessage>,
    inbound: Option<Inbound>,
}

impl<S: Socket> Connection<S> {
    /// Wrap a socket.
    pub fn new(socket: S) -> Self {
        Self { socket, outbound: None, inbound: None }
    }

    /// Underlying socket.
    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Underlying socket, mutably.
    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    /// True while an outbound message is parked.
    pub fn has_pending_send(&self) -> bool {
        self.outbound.is_some()
    }

    /// Parked outbound continuation, if any.
    pub fn pending_send(&self) -> Option<&PendingMessage> {
        self.outbound.as_ref()
    }

    /// True while a partially received message is parked.
    pub fn has_pending_receive(&self) -> bool {
        self.inbound.as_ref().is_some_and(|inbound| {
            inbound.stage != ReceiveStage::Header || inbound.pending.moved() > 0
        })
    }

    /// Frame and send one logical message.
    ///
    /// Writes as much as the socket accepts and parks the rest.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::Busy` if a previous send is still pending
    /// - `ConnectionError::Protocol` if the message exceeds the long-message
    ///   limit
    /// - `ConnectionError::Closed` / `Io` on transport failure
    pub fn send_message(&mut self, message: &[u8]) -> Result<SendStatus> {
        if self.outbound.is_some() {
            return Err(ConnectionError::Busy);
        }

        let mut wire = Vec::with_capacity(message.len() + FrameHeader::SIZE);
        encode_message(message, &mut wire)?;

        self.outbound = Some(PendingMessage::sending(wire));
        self.flush()
    }

    /// Resume a parked send.
    ///
    /// Returns [`SendStatus::Complete`] when nothing is pending.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::Closed` if the socket accepts zero bytes
    /// - `ConnectionError::Io` on transport failure
    pub fn flush(&mut self) -> Result<SendStatus> {
        let Some(pending) = self.outbound.as_mut() else {
            return Ok(SendStatus::Complete);
        };

        while !pending.is_complete() {
            match self.socket.try_write(&pending.buffer[pending.moved..]) {
                Ok(0) => return Err(ConnectionError::Closed),
                Ok(n) => pending.moved += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(SendStatus::Pending),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }

        self.outbound = None;
        Ok(SendStatus::Complete)
    }

    /// Receive one logical message.
    ///
    /// Returns `Ok(None)` when the socket runs dry mid-message; the partial
    /// state is kept and the next call continues it. Long messages come back
    /// reassembled.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::Protocol` on bad markers or a bad long-message
    ///   header. Inbound state is reset so the next call starts at a fresh
    ///   header.
    /// - `ConnectionError::Closed` when the peer closes the stream
    /// - `ConnectionError::Io` on transport failure
    pub fn receive_message(&mut self) -> Result<Option<Bytes>> {
        loop {
            let inbound = self.inbound.get_or_insert_with(Inbound::header);

            while !inbound.pending.is_complete() {
                let pending = &mut inbound.pending;
                match self.socket.try_read(&mut pending.buffer[pending.moved..]) {
                    Ok(0) => return Err(ConnectionError::Closed),
                    Ok(n) => pending.moved += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                    Err(e) => return Err(e.into()),
                }
            }

            let Some(Inbound { stage, pending }) = self.inbound.take() else {
                continue;
            };

            match stage {
                ReceiveStage::Header => {
                    let header = FrameHeader::from_bytes(&pending.buffer)?;
                    if header.payload_len() == 0 {
                        return Ok(Some(Bytes::new()));
                    }
                    self.inbound = Some(Inbound {
                        stage: ReceiveStage::Payload,
                        pending: PendingMessage::receiving(header.payload_len()),
                    });
                },
                ReceiveStage::Payload => {
                    let payload = pending.into_bytes();
                    let Some(long) = LongMessageHeader::parse(&payload)? else {
                        return Ok(Some(payload));
                    };
                    if long.remaining() == 0 {
                        return Ok(Some(long.head));
                    }

                    let mut body = PendingMessage::receiving(long.total);
                    body.buffer[..long.head.len()].copy_from_slice(&long.head);
                    body.moved = long.head.len();
                    self.inbound = Some(Inbound { stage: ReceiveStage::LongBody, pending: body });
                },
                ReceiveStage::LongBody => return Ok(Some(pending.into_bytes())),
            }
        }
    }

    /// Read unframed bytes (transfer channels).
    ///
    /// Returns `Ok(None)` when no bytes are available.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::Closed` at end of stream
    /// - `ConnectionError::Io` on transport failure
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        loop {
            match self.socket.try_read(buf) {
                Ok(0) if !buf.is_empty() => return Err(ConnectionError::Closed),
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Write unframed bytes (transfer channels).
    ///
    /// Returns `Ok(None)` when the socket cannot take any bytes now.
    ///
    /// # Errors
    ///
    /// - `ConnectionError::Busy` if a framed send is still pending
    /// - `ConnectionError::Closed` / `Io` on transport failure
    pub fn write_raw(&mut self, data: &[u8]) -> Result<Option<usize>> {
        if self.outbound.is_some() {
            return Err(ConnectionError::Busy);
        }

        loop {
            match self.socket.try_write(data) {
                Ok(0) if !data.is_empty() => return Err(ConnectionError::Closed),
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {},
                Err(e) => return Err(e.into()),
            }
        }
    }
}
