//! Property-based tests for partial-I/O framing.
//!
//! The transport is squeezed down to arbitrary chunk sizes (including one byte
//! at a time) in both directions. Whatever the chunking, every message must
//! arrive intact, in order, and exactly once.

use parley_core::{
    Connection, ConnectionError, SendStatus,
    memory_socket::{MemoryPeer, MemorySocket, memory_pair},
};
use parley_proto::frame::LONG_MESSAGE_THRESHOLD;
use proptest::prelude::*;

/// Drain every message the connection can assemble from what the peer sent,
/// feeding at most `chunk` bytes per read.
fn receive_all(conn: &mut Connection<MemorySocket>, peer: &MemoryPeer) -> Vec<Vec<u8>> {
    let mut received = Vec::new();
    loop {
        match conn.receive_message() {
            Ok(Some(message)) => received.push(message.to_vec()),
            Ok(None) if peer.unread() == 0 => return received,
            Ok(None) => {},
            Err(e) => panic!("unexpected receive error: {e}"),
        }
    }
}

fn message_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        6 => prop::collection::vec(any::<u8>(), 0..200),
        1 => prop::collection::vec(any::<u8>(), LONG_MESSAGE_THRESHOLD..LONG_MESSAGE_THRESHOLD * 4),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_one_byte_transport_round_trip(
        messages in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 1..8)
    ) {
        let (socket, peer) = memory_pair();
        peer.set_read_chunk(Some(1));
        let mut conn = Connection::new(socket);

        for message in &messages {
            peer.send_message(message);
        }

        prop_assert_eq!(receive_all(&mut conn, &peer), messages);
    }

    #[test]
    fn prop_long_messages_reassemble_under_any_chunking(
        messages in prop::collection::vec(message_strategy(), 1..4),
        chunk in 1usize..700,
    ) {
        let (socket, peer) = memory_pair();
        peer.set_read_chunk(Some(chunk));
        let mut conn = Connection::new(socket);

        for message in &messages {
            peer.send_message(message);
        }

        prop_assert_eq!(receive_all(&mut conn, &peer), messages);
    }

    #[test]
    fn prop_send_resumes_under_write_budget(
        message in message_strategy(),
        budget in 1usize..64,
    ) {
        let (socket, peer) = memory_pair();
        let mut conn = Connection::new(socket);

        peer.set_write_budget(Some(budget));
        let mut status = conn.send_message(&message).expect("send should start");
        while status == SendStatus::Pending {
            prop_assert_eq!(conn.send_message(b"other"), Err(ConnectionError::Busy));
            peer.set_write_budget(Some(budget));
            status = conn.flush().expect("flush should progress");
        }

        let received = peer.take_messages();
        prop_assert_eq!(received.len(), 1);
        let expected = String::from_utf8_lossy(&message);
        prop_assert_eq!(received[0].as_bytes(), expected.as_bytes());
    }
}
