//! In-memory socket for deterministic tests.
//!
//! [`memory_pair`] returns the server end ([`MemorySocket`]) and a handle for
//! the remote client ([`MemoryPeer`]). The peer controls how many bytes each
//! read delivers and how many bytes the socket accepts, which is how tests
//! force partial I/O.

use std::{
    collections::VecDeque,
    io,
    sync::{Arc, Mutex, MutexGuard},
};

use parley_proto::{Frame, FrameHeader, LongMessageHeader, encode_message};

#[derive(Debug, Default)]
struct Shared {
    /// Bytes sent by the peer, not yet read by the server
    inbound: VecDeque<u8>,
    /// Bytes written by the server, not yet taken by the peer
    outbound: Vec<u8>,
    /// Max bytes returned per `try_read`
    read_chunk: Option<usize>,
    /// Bytes the server may still write before `WouldBlock`
    write_budget: Option<usize>,
    peer_closed: bool,
    server_dropped: bool,
}

/// Server end of an in-memory stream.
#[derive(Debug)]
pub struct MemorySocket {
    shared: Arc<Mutex<Shared>>,
}

/// Client end of an in-memory stream.
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    shared: Arc<Mutex<Shared>>,
}

/// Connected socket/peer pair.
pub fn memory_pair() -> (MemorySocket, MemoryPeer) {
    let shared = Arc::new(Mutex::new(Shared::default()));
    (MemorySocket { shared: Arc::clone(&shared) }, MemoryPeer { shared })
}

#[allow(clippy::expect_used)]
fn lock(shared: &Mutex<Shared>) -> MutexGuard<'_, Shared> {
    shared.lock().expect("Mutex poisoned")
}

impl crate::connection::Socket for MemorySocket {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut shared = lock(&self.shared);
        if shared.inbound.is_empty() {
            if shared.peer_closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let limit = shared.read_chunk.unwrap_or(usize::MAX);
        let n = buf.len().min(shared.inbound.len()).min(limit);
        for (slot, byte) in buf.iter_mut().zip(shared.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut shared = lock(&self.shared);
        if shared.peer_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let n = match shared.write_budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let n = buf.len().min(budget);
                shared.write_budget = Some(budget - n);
                n
            },
            None => buf.len(),
        };
        shared.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

impl Drop for MemorySocket {
    fn drop(&mut self) {
        lock(&self.shared).server_dropped = true;
    }
}

impl MemoryPeer {
    /// Queue raw bytes for the server to read.
    pub fn send_raw(&self, bytes: &[u8]) {
        lock(&self.shared).inbound.extend(bytes.iter().copied());
    }

    /// Frame one message (inline or long form) and queue it.
    #[allow(clippy::expect_used)]
    pub fn send_message(&self, message: &[u8]) {
        let mut wire = Vec::new();
        encode_message(message, &mut wire).expect("test message fits the long-message limit");
        self.send_raw(&wire);
    }

    /// Limit how many bytes each server read returns (`None` = unlimited).
    pub fn set_read_chunk(&self, chunk: Option<usize>) {
        lock(&self.shared).read_chunk = chunk;
    }

    /// Limit how many more bytes the server may write (`None` = unlimited).
    pub fn set_write_budget(&self, budget: Option<usize>) {
        lock(&self.shared).write_budget = budget;
    }

    /// Number of bytes still queued for the server.
    pub fn unread(&self) -> usize {
        lock(&self.shared).inbound.len()
    }

    /// Close the client side. The server sees end of stream once it has
    /// drained what was already sent.
    pub fn close(&self) {
        lock(&self.shared).peer_closed = true;
    }

    /// True once the server has dropped its end.
    pub fn is_dropped(&self) -> bool {
        lock(&self.shared).server_dropped
    }

    /// Take every byte the server has written.
    pub fn take_raw(&self) -> Vec<u8> {
        std::mem::take(&mut lock(&self.shared).outbound)
    }

    /// Take every complete message the server has written, as text.
    ///
    /// A trailing partial message stays buffered for the next call.
    pub fn take_messages(&self) -> Vec<String> {
        let mut shared = lock(&self.shared);
        let mut messages = Vec::new();
        let mut offset = 0;

        while let Some((message, consumed)) = decode_one(&shared.outbound[offset..]) {
            messages.push(String::from_utf8_lossy(&message).into_owned());
            offset += consumed;
        }

        shared.outbound.drain(..offset);
        messages
    }
}

fn decode_one(wire: &[u8]) -> Option<(Vec<u8>, usize)> {
    let frame = Frame::decode(wire).ok()?;
    let consumed = FrameHeader::SIZE + frame.payload.len();

    match LongMessageHeader::parse(&frame.payload).ok()? {
        None => Some((frame.payload.to_vec(), consumed)),
        Some(long) => {
            let tail = wire.get(consumed..consumed + long.remaining())?;
            let mut message = long.head.to_vec();
            message.extend_from_slice(tail);
            Some((message, consumed + long.remaining()))
        },
    }
}
