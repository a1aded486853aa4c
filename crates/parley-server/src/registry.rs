//! Connection registry for live connections and registered users.
//!
//! The registry owns every accepted connection together with its role and
//! outbound queue, plus the name → connection reverse index used to route
//! messages to users. Names are unique among registered users; removing a
//! connection removes its name.

use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    net::{IpAddr, SocketAddr},
};

use bytes::Bytes;
use parley_core::{Connection, ConnectionError, SendStatus, Socket};
use parley_proto::{ErrorCode, frame::MAX_LONG_MESSAGE_SIZE};
use thiserror::Error;

use crate::transfer::ChannelIo;

/// Connection identity assigned by the runtime.
pub type ConnId = u64;

/// Longest accepted user or group name.
pub const MAX_NAME_LEN: usize = 32;

/// Highest collision suffix tried during registration.
pub const MAX_NAME_SUFFIX: u32 = 999;

/// Readiness a connection should be armed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    /// Wake on read readiness
    pub read: bool,
    /// Wake on write readiness
    pub write: bool,
}

impl Interest {
    /// Read only.
    pub const READ: Self = Self { read: true, write: false };
}

/// A registered identity layered on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSession {
    /// Unique display name (after collision handling)
    pub name: String,
    /// Bypasses group permission checks
    pub admin: bool,
    /// Groups the user has joined
    pub groups: BTreeSet<String>,
}

impl UserSession {
    fn new(name: String) -> Self {
        Self { name, admin: false, groups: BTreeSet::new() }
    }
}

/// What a connection is used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Accepted, no `!register` or channel claim yet
    Unregistered,
    /// Main session connection of a user
    User(UserSession),
    /// Secondary connection carrying raw transfer bytes for `owner`
    TransferChannel {
        /// User whose transfer this channel serves
        owner: String,
    },
}

/// One accepted connection.
#[derive(Debug)]
pub struct ConnectionEntry<S> {
    /// Framed connection
    pub conn: Connection<S>,
    /// Remote address
    pub peer: SocketAddr,
    /// Current role
    pub role: Role,
    outbox: VecDeque<Bytes>,
    interest: Interest,
}

/// Errors from registry operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Connection id is already in use
    #[error("connection {0} already exists")]
    ConnectionExists(ConnId),

    /// No such connection
    #[error("connection {0} not found")]
    UnknownConnection(ConnId),

    /// Peer address is banned
    #[error("address {0} is banned")]
    Banned(IpAddr),

    /// Too many live connections
    #[error("connection limit of {0} reached")]
    AtCapacity(usize),

    /// Connection already carries a session or channel
    #[error("connection is already registered")]
    AlreadyRegistered,

    /// Name violates the naming rule
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// No collision suffix fits
    #[error("no free variant of name {0:?}")]
    NameExhausted(String),

    /// Outbound queue is full
    #[error("outbound queue of connection {0} is full")]
    OutboxFull(ConnId),

    /// Message is larger than a long message may be
    #[error("{len} byte message for connection {conn_id} exceeds the long-message limit")]
    MessageTooLarge {
        /// Destination connection
        conn_id: ConnId,
        /// Message length
        len: usize,
    },

    /// Transport failure while flushing
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl RegistryError {
    /// Error code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::AlreadyRegistered => ErrorCode::AlreadyRegistered,
            Self::InvalidName(_) => ErrorCode::InvalidName,
            Self::NameExhausted(_) => ErrorCode::NameExhausted,
            _ => ErrorCode::BadCommand,
        }
    }
}

/// True if `name` is 1..=32 ASCII letters, digits, `.`, `_` or `-`.
pub fn is_valid_name(name: &str) -> bool {
    (1..=MAX_NAME_LEN).contains(&name.len())
        && name.bytes().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

/// Registry of live connections and registered users.
///
/// Maintains the reverse index name → connection so messages to a user are
/// routed in O(1). One connection per name.
#[derive(Debug)]
pub struct ConnectionRegistry<S> {
    /// Connection id → entry
    entries: HashMap<ConnId, ConnectionEntry<S>>,
    /// User name → connection id (reverse index)
    users: HashMap<String, ConnId>,
    /// Refused peer addresses
    banned: HashSet<IpAddr>,
    outbox_capacity: usize,
    max_connections: usize,
}

impl<S: Socket> ConnectionRegistry<S> {
    /// Create an empty registry.
    pub fn new(outbox_capacity: usize, max_connections: usize) -> Self {
        Self {
            entries: HashMap::new(),
            users: HashMap::new(),
            banned: HashSet::new(),
            outbox_capacity,
            max_connections,
        }
    }

    /// Add a freshly accepted connection as [`Role::Unregistered`].
    ///
    /// # Errors
    ///
    /// - `RegistryError::Banned` if the peer address is banned
    /// - `RegistryError::AtCapacity` if the connection limit is reached
    /// - `RegistryError::ConnectionExists` if the id is taken
    pub fn accept(
        &mut self,
        conn_id: ConnId,
        peer: SocketAddr,
        socket: S,
    ) -> Result<(), RegistryError> {
        if self.banned.contains(&peer.ip()) {
            return Err(RegistryError::Banned(peer.ip()));
        }
        if self.entries.len() >= self.max_connections {
            return Err(RegistryError::AtCapacity(self.max_connections));
        }
        if self.entries.contains_key(&conn_id) {
            return Err(RegistryError::ConnectionExists(conn_id));
        }

        self.entries.insert(conn_id, ConnectionEntry {
            conn: Connection::new(socket),
            peer,
            role: Role::Unregistered,
            outbox: VecDeque::new(),
            interest: Interest::READ,
        });
        Ok(())
    }

    /// Remove a connection, releasing its name.
    ///
    /// Returns `None` if it was already removed.
    pub fn remove(&mut self, conn_id: ConnId) -> Option<ConnectionEntry<S>> {
        let entry = self.entries.remove(&conn_id)?;
        if let Role::User(session) = &entry.role {
            self.users.remove(&session.name);
        }
        Some(entry)
    }

    /// Register a user name on an unregistered connection.
    ///
    /// A taken name gets the first free `_N` suffix (N up to 999) that keeps
    /// it within [`MAX_NAME_LEN`].
    ///
    /// # Errors
    ///
    /// - `RegistryError::AlreadyRegistered` if the connection has a role
    /// - `RegistryError::InvalidName` if the name violates the naming rule
    /// - `RegistryError::NameExhausted` if no suffix fits
    pub fn register_user(
        &mut self,
        conn_id: ConnId,
        requested: &str,
    ) -> Result<String, RegistryError> {
        let entry =
            self.entries.get(&conn_id).ok_or(RegistryError::UnknownConnection(conn_id))?;
        if entry.role != Role::Unregistered {
            return Err(RegistryError::AlreadyRegistered);
        }
        if !is_valid_name(requested) {
            return Err(RegistryError::InvalidName(requested.to_string()));
        }

        let name = self
            .free_variant(requested)
            .ok_or_else(|| RegistryError::NameExhausted(requested.to_string()))?;

        if let Some(entry) = self.entries.get_mut(&conn_id) {
            entry.role = Role::User(UserSession::new(name.clone()));
        }
        self.users.insert(name.clone(), conn_id);
        Ok(name)
    }

    fn free_variant(&self, requested: &str) -> Option<String> {
        if !self.users.contains_key(requested) {
            return Some(requested.to_string());
        }

        (1..=MAX_NAME_SUFFIX)
            .map(|n| format!("{requested}_{n}"))
            .take_while(|candidate| candidate.len() <= MAX_NAME_LEN)
            .find(|candidate| !self.users.contains_key(candidate))
    }

    /// Reclassify an unregistered connection as a transfer channel.
    ///
    /// # Errors
    ///
    /// - `RegistryError::AlreadyRegistered` if the connection has a role
    pub fn mark_channel(&mut self, conn_id: ConnId, owner: &str) -> Result<(), RegistryError> {
        let entry =
            self.entries.get_mut(&conn_id).ok_or(RegistryError::UnknownConnection(conn_id))?;
        if entry.role != Role::Unregistered {
            return Err(RegistryError::AlreadyRegistered);
        }
        entry.role = Role::TransferChannel { owner: owner.to_string() };
        Ok(())
    }

    /// Entry for a connection.
    pub fn entry(&self, conn_id: ConnId) -> Option<&ConnectionEntry<S>> {
        self.entries.get(&conn_id)
    }

    /// Mutable entry for a connection.
    pub fn entry_mut(&mut self, conn_id: ConnId) -> Option<&mut ConnectionEntry<S>> {
        self.entries.get_mut(&conn_id)
    }

    /// Role of a connection.
    pub fn role(&self, conn_id: ConnId) -> Option<&Role> {
        self.entries.get(&conn_id).map(|entry| &entry.role)
    }

    /// User session on a connection.
    pub fn user(&self, conn_id: ConnId) -> Option<&UserSession> {
        match self.role(conn_id)? {
            Role::User(session) => Some(session),
            _ => None,
        }
    }

    /// Mutable user session of a named user.
    pub fn user_by_name_mut(&mut self, name: &str) -> Option<&mut UserSession> {
        let conn_id = *self.users.get(name)?;
        match &mut self.entries.get_mut(&conn_id)?.role {
            Role::User(session) => Some(session),
            _ => None,
        }
    }

    /// Connection of a registered user.
    pub fn conn_for_user(&self, name: &str) -> Option<ConnId> {
        self.users.get(name).copied()
    }

    /// True if a user with this name is registered.
    pub fn is_online(&self, name: &str) -> bool {
        self.users.contains_key(name)
    }

    /// Registered user names, sorted.
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<_> = self.users.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every live connection id.
    pub fn conn_ids(&self) -> Vec<ConnId> {
        self.entries.keys().copied().collect()
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no connection is live.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of registered users.
    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Queue a message and push as much of the queue as the socket accepts.
    ///
    /// # Errors
    ///
    /// - `RegistryError::UnknownConnection` if the connection is gone
    /// - `RegistryError::MessageTooLarge` if the message cannot be framed
    /// - `RegistryError::OutboxFull` if the queue is at capacity
    /// - `RegistryError::Connection` on transport failure
    pub fn enqueue(&mut self, conn_id: ConnId, message: Bytes) -> Result<(), RegistryError> {
        let capacity = self.outbox_capacity;
        let entry =
            self.entries.get_mut(&conn_id).ok_or(RegistryError::UnknownConnection(conn_id))?;
        if message.len() > MAX_LONG_MESSAGE_SIZE {
            return Err(RegistryError::MessageTooLarge { conn_id, len: message.len() });
        }
        if entry.outbox.len() >= capacity {
            return Err(RegistryError::OutboxFull(conn_id));
        }
        entry.outbox.push_back(message);
        Self::pump(entry)
    }

    /// Continue a parked send and drain the queue.
    ///
    /// # Errors
    ///
    /// - `RegistryError::UnknownConnection` if the connection is gone
    /// - `RegistryError::Connection` on transport failure
    pub fn flush(&mut self, conn_id: ConnId) -> Result<(), RegistryError> {
        let entry =
            self.entries.get_mut(&conn_id).ok_or(RegistryError::UnknownConnection(conn_id))?;
        Self::pump(entry)
    }

    fn pump(entry: &mut ConnectionEntry<S>) -> Result<(), RegistryError> {
        if entry.conn.flush()? == SendStatus::Pending {
            return Ok(());
        }

        while let Some(message) = entry.outbox.pop_front() {
            match entry.conn.send_message(&message) {
                Ok(SendStatus::Complete) => {},
                Ok(SendStatus::Pending) => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// True while queued or parked bytes are waiting for the socket.
    pub fn has_pending_output(&self, conn_id: ConnId) -> bool {
        self.entries
            .get(&conn_id)
            .is_some_and(|entry| entry.conn.has_pending_send() || !entry.outbox.is_empty())
    }

    /// Interest for a framed (non-channel) connection.
    pub fn framed_interest(&self, conn_id: ConnId) -> Interest {
        Interest { read: true, write: self.has_pending_output(conn_id) }
    }

    /// Record the interest the runtime is armed with.
    ///
    /// Returns `true` if it changed.
    pub fn set_interest(&mut self, conn_id: ConnId, interest: Interest) -> bool {
        match self.entries.get_mut(&conn_id) {
            Some(entry) if entry.interest != interest => {
                entry.interest = interest;
                true
            },
            _ => false,
        }
    }

    /// Refuse future connections from `ip`. Returns `false` if already banned.
    pub fn ban(&mut self, ip: IpAddr) -> bool {
        self.banned.insert(ip)
    }

    /// Lift a ban. Returns `false` if `ip` was not banned.
    pub fn unban(&mut self, ip: IpAddr) -> bool {
        self.banned.remove(&ip)
    }

    /// True if `ip` is banned.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.banned.contains(&ip)
    }

    /// Connections whose peer address is `ip`.
    pub fn conns_from(&self, ip: IpAddr) -> Vec<ConnId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.peer.ip() == ip)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl<S: Socket> ChannelIo for ConnectionRegistry<S> {
    fn read_raw(
        &mut self,
        conn_id: ConnId,
        buf: &mut [u8],
    ) -> Result<Option<usize>, ConnectionError> {
        self.entries.get_mut(&conn_id).ok_or(ConnectionError::Closed)?.conn.read_raw(buf)
    }

    fn write_raw(&mut self, conn_id: ConnId, data: &[u8]) -> Result<Option<usize>, ConnectionError> {
        self.entries.get_mut(&conn_id).ok_or(ConnectionError::Closed)?.conn.write_raw(data)
    }
}

#[cfg(test)]
mod tests {
    use parley_core::memory_socket::{MemoryPeer, MemorySocket, memory_pair};

    use super::*;

    fn addr(last: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, last], 40000))
    }

    fn registry_with(n: u64) -> (ConnectionRegistry<MemorySocket>, Vec<MemoryPeer>) {
        let mut registry = ConnectionRegistry::new(4, 100);
        let mut peers = Vec::new();
        for id in 1..=n {
            let (socket, peer) = memory_pair();
            registry.accept(id, addr(id as u8), socket).unwrap();
            peers.push(peer);
        }
        (registry, peers)
    }

    #[test]
    fn name_collisions_get_suffixes() {
        let (mut registry, _peers) = registry_with(3);

        assert_eq!(registry.register_user(1, "alice").unwrap(), "alice");
        assert_eq!(registry.register_user(2, "alice").unwrap(), "alice_1");
        assert_eq!(registry.register_user(3, "alice").unwrap(), "alice_2");
        assert_eq!(registry.usernames(), vec!["alice", "alice_1", "alice_2"]);
    }

    #[test]
    fn suffix_must_fit_name_budget() {
        let (mut registry, _peers) = registry_with(3);
        let long = "x".repeat(MAX_NAME_LEN);
        let almost = "y".repeat(MAX_NAME_LEN - 2);

        registry.register_user(1, &long).unwrap();
        assert_eq!(
            registry.register_user(2, &long),
            Err(RegistryError::NameExhausted(long.clone()))
        );

        registry.register_user(3, &almost).unwrap();
        assert!(registry.free_variant(&almost).is_some_and(|n| n.len() == MAX_NAME_LEN));
    }

    #[test]
    fn invalid_names_are_rejected() {
        let (mut registry, _peers) = registry_with(1);

        assert!(matches!(registry.register_user(1, "bad name"), Err(RegistryError::InvalidName(_))));
        assert!(matches!(registry.register_user(1, ""), Err(RegistryError::InvalidName(_))));
        assert!(is_valid_name("ok.name_-1"));
    }

    #[test]
    fn second_registration_is_refused() {
        let (mut registry, _peers) = registry_with(1);
        registry.register_user(1, "bob").unwrap();
        assert_eq!(registry.register_user(1, "bob"), Err(RegistryError::AlreadyRegistered));
    }

    #[test]
    fn remove_releases_name() {
        let (mut registry, _peers) = registry_with(2);
        registry.register_user(1, "bob").unwrap();

        let entry = registry.remove(1).unwrap();
        assert!(matches!(entry.role, Role::User(ref s) if s.name == "bob"));
        assert!(registry.remove(1).is_none());

        assert_eq!(registry.register_user(2, "bob").unwrap(), "bob");
    }

    #[test]
    fn banned_addresses_are_refused() {
        let (mut registry, _peers) = registry_with(1);
        registry.ban(addr(9).ip());

        let (socket, _peer) = memory_pair();
        assert_eq!(registry.accept(9, addr(9), socket), Err(RegistryError::Banned(addr(9).ip())));
        assert_eq!(registry.conns_from(addr(1).ip()), vec![1]);

        assert!(registry.unban(addr(9).ip()));
        let (socket, _peer) = memory_pair();
        assert!(registry.accept(9, addr(9), socket).is_ok());
    }

    #[test]
    fn connection_limit_is_enforced() {
        let mut registry = ConnectionRegistry::new(4, 1);
        let (socket, _peer) = memory_pair();
        registry.accept(1, addr(1), socket).unwrap();

        let (socket, _peer) = memory_pair();
        assert_eq!(registry.accept(2, addr(2), socket), Err(RegistryError::AtCapacity(1)));
    }

    #[test]
    fn outbox_drains_in_order_once_writable() {
        let (mut registry, peers) = registry_with(1);
        peers[0].set_write_budget(Some(0));

        registry.enqueue(1, Bytes::from_static(b"one")).unwrap();
        registry.enqueue(1, Bytes::from_static(b"two")).unwrap();
        assert!(registry.has_pending_output(1));
        assert_eq!(registry.framed_interest(1), Interest { read: true, write: true });

        peers[0].set_write_budget(None);
        registry.flush(1).unwrap();
        assert!(!registry.has_pending_output(1));
        assert_eq!(peers[0].take_messages(), vec!["one", "two"]);
    }

    #[test]
    fn outbox_overflow_is_reported() {
        let (mut registry, peers) = registry_with(1);
        peers[0].set_write_budget(Some(0));

        // The first message parks in the connection, the next four fill the queue.
        for _ in 0..5 {
            registry.enqueue(1, Bytes::from_static(b"x")).unwrap();
        }
        assert_eq!(registry.enqueue(1, Bytes::from_static(b"x")), Err(RegistryError::OutboxFull(1)));
    }

    #[test]
    fn oversized_messages_are_refused_before_queueing() {
        let (mut registry, peers) = registry_with(1);
        let huge = Bytes::from(vec![b'x'; MAX_LONG_MESSAGE_SIZE + 1]);

        assert_eq!(
            registry.enqueue(1, huge),
            Err(RegistryError::MessageTooLarge { conn_id: 1, len: MAX_LONG_MESSAGE_SIZE + 1 })
        );
        assert!(!registry.has_pending_output(1));

        registry.enqueue(1, Bytes::from_static(b"after")).unwrap();
        assert_eq!(peers[0].take_messages(), vec!["after"]);
    }

    #[test]
    fn channel_marking_requires_unregistered() {
        let (mut registry, _peers) = registry_with(2);
        registry.register_user(1, "bob").unwrap();

        assert_eq!(registry.mark_channel(1, "bob"), Err(RegistryError::AlreadyRegistered));
        registry.mark_channel(2, "bob").unwrap();
        assert_eq!(registry.role(2), Some(&Role::TransferChannel { owner: "bob".to_string() }));
    }
}
