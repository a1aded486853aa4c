//! File-transfer relay.
//!
//! Tracks one [`TransferState`] per user session and moves file bytes between
//! transfer channels, or between a channel and group storage. Bytes move one
//! piece at a time: a new piece is not read from the source until the previous
//! one has been fully written to the destination.
//!
//! ```text
//! Requested ──accept──▶ Negotiating ──channel──▶ ChannelOpen ──bytes──▶ Forwarding ──▶ Completed
//!     │                      │                        │                     │
//!     └── reject / cancel / expire / disconnect / channel close: both sides torn down
//! ```
//!
//! The relay never owns sockets. Channel reads and writes go through
//! [`ChannelIo`], implemented by the connection registry.

use std::{
    collections::HashMap,
    fmt,
    io::{Read, Write},
};

use parley_core::ConnectionError;
use parley_proto::{ChannelClaim, ErrorCode, FileOffer, Notice};
use thiserror::Error;

use crate::{
    group_manager::GroupFile,
    registry::{ConnId, Interest},
    storage::{FileStore, StorageError},
    timer::{TimerId, TimerTable},
};

/// Length of a capability token.
pub const TOKEN_LEN: usize = 16;

/// Bytes moved per relay cycle.
pub const PIECE_SIZE: usize = 16 * 1024;

/// Which way bytes flow relative to the owning user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The user supplies the bytes
    Send,
    /// The user consumes the bytes
    Receive,
}

/// Other end of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Another user's channel
    User(String),
    /// A group's storage
    Group(String),
}

impl Endpoint {
    /// User or group name.
    pub fn name(&self) -> &str {
        match self {
            Self::User(name) | Self::Group(name) => name,
        }
    }

    fn is_user(&self, name: &str) -> bool {
        matches!(self, Self::User(user) if user == name)
    }
}

/// Lifecycle phase of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Offer sent, waiting for the target
    Requested,
    /// Agreed, waiting for channels
    Negotiating,
    /// This side's channel is registered
    ChannelOpen,
    /// Bytes are moving
    Forwarding,
    /// Every byte has reached the receiver
    Completed,
}

/// Piece in flight.
#[derive(Debug, Default)]
struct PieceBuffer {
    data: Vec<u8>,
    offset: usize,
}

impl PieceBuffer {
    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn pending(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    fn fill(&mut self, data: Vec<u8>) {
        self.data = data;
        self.offset = 0;
    }

    fn advance(&mut self, n: usize) {
        self.offset += n;
        if self.is_empty() {
            self.data.clear();
            self.offset = 0;
        }
    }
}

enum StorageEnd<F: FileStore> {
    None,
    Upload { stored_name: String, writer: F::Writer },
    Download { reader: F::Reader },
}

/// Transfer bookkeeping attached to one user session.
pub struct TransferState<F: FileStore> {
    direction: Direction,
    peer: Endpoint,
    offer: FileOffer,
    token: String,
    transferred: u64,
    phase: Phase,
    timer: Option<TimerId>,
    channel: Option<ConnId>,
    piece: PieceBuffer,
    storage: StorageEnd<F>,
}

impl<F: FileStore> TransferState<F> {
    fn new(direction: Direction, peer: Endpoint, offer: FileOffer, token: String) -> Self {
        Self {
            direction,
            peer,
            offer,
            token,
            transferred: 0,
            phase: Phase::Negotiating,
            timer: None,
            channel: None,
            piece: PieceBuffer::default(),
            storage: StorageEnd::None,
        }
    }

    /// Direction relative to the owner.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Other end.
    pub fn peer(&self) -> &Endpoint {
        &self.peer
    }

    /// File being moved.
    pub fn offer(&self) -> &FileOffer {
        &self.offer
    }

    /// Capability token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Bytes moved so far on this side.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Registered transfer channel.
    pub fn channel(&self) -> Option<ConnId> {
        self.channel
    }

    fn remaining(&self) -> u64 {
        self.offer.size.saturating_sub(self.transferred)
    }
}

impl<F: FileStore> fmt::Debug for TransferState<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferState")
            .field("direction", &self.direction)
            .field("peer", &self.peer)
            .field("offer", &self.offer)
            .field("transferred", &self.transferred)
            .field("phase", &self.phase)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

/// Raw byte access to transfer channels.
pub trait ChannelIo {
    /// Read unframed bytes. `Ok(None)` when nothing is available.
    fn read_raw(&mut self, conn: ConnId, buf: &mut [u8]) -> Result<Option<usize>, ConnectionError>;

    /// Write unframed bytes. `Ok(None)` when the socket is full.
    fn write_raw(&mut self, conn: ConnId, data: &[u8]) -> Result<Option<usize>, ConnectionError>;
}

/// Actions returned by the relay for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferAction {
    /// Send a notice to a user
    Notify {
        /// Recipient
        user: String,
        /// Notice
        notice: Notice,
    },
    /// Disconnect a transfer channel
    CloseChannel {
        /// Channel connection
        conn: ConnId,
    },
    /// A verified upload must be registered with its group
    FileStored {
        /// Destination group
        group: String,
        /// Uploading user
        uploader: String,
        /// Stored (de-duplicated) name
        filename: String,
        /// Size in bytes
        size: u64,
        /// CRC-32 of the content
        crc: u32,
    },
}

fn notify(user: &str, notice: Notice) -> TransferAction {
    TransferAction::Notify { user: user.to_string(), notice }
}

/// Errors from transfer operations.
#[derive(Debug, Error)]
pub enum TransferError {
    /// `!sendfile` without a target
    #[error("transfer request has no target")]
    MissingTarget,

    /// Transfer to oneself
    #[error("transfer targets the sender")]
    SelfTarget,

    /// Target is not online
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// A transfer is already attached to this user
    #[error("{0} already has a transfer")]
    Busy(String),

    /// No matching transfer
    #[error("no transfer with {0}")]
    NoTransfer(String),

    /// Channel registration or acceptance does not match the stored state
    #[error("transfer registration does not match")]
    TokenMismatch,

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TransferError {
    /// Error code reported to the client.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MissingTarget => ErrorCode::BadCommand,
            Self::SelfTarget => ErrorCode::SelfTarget,
            Self::UserNotFound(_) => ErrorCode::UserNotFound,
            Self::Busy(_) => ErrorCode::TransferBusy,
            Self::NoTransfer(_) => ErrorCode::NoTransfer,
            Self::TokenMismatch => ErrorCode::TokenMismatch,
            Self::Storage(StorageError::NotFound { .. }) => ErrorCode::FileNotFound,
            Self::Storage(_) => ErrorCode::Storage,
        }
    }

    /// Error notice for the requester.
    pub fn notice(&self) -> Notice {
        match self {
            Self::MissingTarget => Notice::error_with(self.code(), "missing target"),
            Self::UserNotFound(name) | Self::Busy(name) | Self::NoTransfer(name) => {
                Notice::error_with(self.code(), name.clone())
            },
            _ => Notice::error(self.code()),
        }
    }
}

/// Relay state for every transfer on the server.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
#[derive(Debug)]
pub struct TransferRelay<F: FileStore, I> {
    store: F,
    /// Owner user → state
    transfers: HashMap<String, TransferState<F>>,
    /// Channel connection → owner user
    channels: HashMap<ConnId, String>,
    timers: TimerTable<I>,
}

impl<F: FileStore, I: Copy + Ord> TransferRelay<F, I> {
    /// Create a relay writing group uploads to `store`.
    pub fn new(store: F) -> Self {
        Self {
            store,
            transfers: HashMap::new(),
            channels: HashMap::new(),
            timers: TimerTable::new(),
        }
    }

    /// Group storage.
    pub fn store(&self) -> &F {
        &self.store
    }

    /// Transfer attached to a user.
    pub fn state(&self, user: &str) -> Option<&TransferState<F>> {
        self.transfers.get(user)
    }

    /// True if `conn` is a registered transfer channel.
    pub fn is_channel(&self, conn: ConnId) -> bool {
        self.channels.contains_key(&conn)
    }

    /// Every registered channel.
    pub fn channel_ids(&self) -> Vec<ConnId> {
        self.channels.keys().copied().collect()
    }

    /// Number of pending invite timers.
    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }

    fn ensure_idle(&self, user: &str) -> Result<(), TransferError> {
        if self.transfers.contains_key(user) {
            return Err(TransferError::Busy(user.to_string()));
        }
        Ok(())
    }

    /// Offer a file to another user.
    ///
    /// Stores a `Requested` state on the sender and arms its expiry timer.
    ///
    /// # Errors
    ///
    /// - `TransferError::MissingTarget` / `SelfTarget` / `UserNotFound`
    /// - `TransferError::Busy` if either side already has a transfer
    pub fn request(
        &mut self,
        sender: &str,
        target: Option<&str>,
        offer: FileOffer,
        token: String,
        is_online: impl Fn(&str) -> bool,
        deadline: I,
    ) -> Result<Vec<TransferAction>, TransferError> {
        let target = target.ok_or(TransferError::MissingTarget)?;
        if target == sender {
            return Err(TransferError::SelfTarget);
        }
        if !is_online(target) {
            return Err(TransferError::UserNotFound(target.to_string()));
        }
        self.ensure_idle(sender)?;
        self.ensure_idle(target)?;

        let actions = vec![
            notify(target, Notice::SendFile {
                offer: offer.clone(),
                sender: sender.to_string(),
                token: token.clone(),
            }),
            notify(sender, Notice::SendFileOk {
                filename: offer.filename.clone(),
                target: target.to_string(),
                token: token.clone(),
            }),
        ];

        let mut state =
            TransferState::new(Direction::Send, Endpoint::User(target.to_string()), offer, token);
        state.phase = Phase::Requested;
        state.timer = Some(self.timers.arm(sender, deadline));
        self.transfers.insert(sender.to_string(), state);
        Ok(actions)
    }

    /// Accept an offer from `sender`.
    ///
    /// # Errors
    ///
    /// - `TransferError::NoTransfer` if `sender` has no request for `receiver`
    /// - `TransferError::TokenMismatch` if the token or file does not match
    /// - `TransferError::Busy` if the receiver already has a transfer
    pub fn accept(
        &mut self,
        receiver: &str,
        sender: &str,
        offer: &FileOffer,
        token: &str,
    ) -> Result<Vec<TransferAction>, TransferError> {
        let state = self
            .transfers
            .get(sender)
            .filter(|s| s.phase == Phase::Requested && s.peer.is_user(receiver))
            .ok_or_else(|| TransferError::NoTransfer(sender.to_string()))?;
        if state.token != token || &state.offer != offer {
            return Err(TransferError::TokenMismatch);
        }
        self.ensure_idle(receiver)?;

        let Some(state) = self.transfers.get_mut(sender) else {
            return Err(TransferError::NoTransfer(sender.to_string()));
        };
        if let Some(timer) = state.timer.take() {
            self.timers.cancel(timer);
        }
        state.phase = Phase::Negotiating;

        self.transfers.insert(
            receiver.to_string(),
            TransferState::new(
                Direction::Receive,
                Endpoint::User(sender.to_string()),
                offer.clone(),
                token.to_string(),
            ),
        );

        Ok(vec![notify(sender, Notice::AcceptFile {
            offer: offer.clone(),
            receiver: receiver.to_string(),
            token: token.to_string(),
        })])
    }

    /// Decline an offer from `sender`.
    ///
    /// # Errors
    ///
    /// - `TransferError::NoTransfer` if `sender` has no request for the caller
    pub fn reject(
        &mut self,
        rejecter: &str,
        sender: &str,
        reason: &str,
    ) -> Result<Vec<TransferAction>, TransferError> {
        let requested = self
            .transfers
            .get(sender)
            .is_some_and(|s| s.phase == Phase::Requested && s.peer.is_user(rejecter));
        if !requested {
            return Err(TransferError::NoTransfer(sender.to_string()));
        }

        if let Some(state) = self.transfers.remove(sender) {
            self.release(state);
        }
        Ok(vec![notify(sender, Notice::RejectFile {
            user: rejecter.to_string(),
            reason: reason.to_string(),
        })])
    }

    /// Cancel the transfer between the caller and `counterpart`.
    ///
    /// # Errors
    ///
    /// - `TransferError::NoTransfer` if no such transfer exists
    pub fn cancel(
        &mut self,
        canceller: &str,
        counterpart: &str,
        reason: &str,
    ) -> Result<Vec<TransferAction>, TransferError> {
        if self.transfers.get(canceller).is_some_and(|s| s.peer.name() == counterpart) {
            return Ok(self.teardown(canceller, reason, Some(canceller)));
        }
        if self.transfers.get(counterpart).is_some_and(|s| s.peer.is_user(canceller)) {
            return Ok(self.teardown(counterpart, reason, Some(canceller)));
        }
        Err(TransferError::NoTransfer(counterpart.to_string()))
    }

    /// Start an upload of `offer` into `group`. Authorization is the caller's
    /// job.
    ///
    /// # Errors
    ///
    /// - `TransferError::Busy` if the user already has a transfer
    pub fn begin_put(
        &mut self,
        user: &str,
        group: &str,
        offer: FileOffer,
        token: String,
    ) -> Result<Vec<TransferAction>, TransferError> {
        self.ensure_idle(user)?;

        let notice = Notice::PutFileOk {
            group: group.to_string(),
            filename: offer.filename.clone(),
            token: token.clone(),
        };
        self.transfers.insert(
            user.to_string(),
            TransferState::new(Direction::Send, Endpoint::Group(group.to_string()), offer, token),
        );
        Ok(vec![notify(user, notice)])
    }

    /// Start a download of `file` from `group`. Authorization is the caller's
    /// job.
    ///
    /// # Errors
    ///
    /// - `TransferError::Busy` if the user already has a transfer
    pub fn begin_get(
        &mut self,
        user: &str,
        group: &str,
        file: &GroupFile,
        token: String,
    ) -> Result<Vec<TransferAction>, TransferError> {
        self.ensure_idle(user)?;

        let offer = FileOffer { filename: file.filename.clone(), size: file.size, crc: file.crc };
        let notice = Notice::GetFileOk {
            group: group.to_string(),
            id: file.id,
            offer: offer.clone(),
            token: token.clone(),
        };
        self.transfers.insert(
            user.to_string(),
            TransferState::new(Direction::Receive, Endpoint::Group(group.to_string()), offer, token),
        );
        Ok(vec![notify(user, notice)])
    }

    /// Attach a freshly registered channel to the claimed transfer.
    ///
    /// The claim is checked against the state of the claimed identity (sender
    /// for `Send`, receiver for `Receive`), never the new connection. Returns
    /// the owning user.
    ///
    /// # Errors
    ///
    /// - `TransferError::TokenMismatch` on any mismatch
    pub fn register_channel(
        &mut self,
        conn: ConnId,
        claim: &ChannelClaim,
        direction: Direction,
    ) -> Result<(String, Vec<TransferAction>), TransferError> {
        let (owner, peer) = match direction {
            Direction::Send => (&claim.sender, &claim.receiver),
            Direction::Receive => (&claim.receiver, &claim.sender),
        };

        let state = self.transfers.get(owner.as_str()).ok_or(TransferError::TokenMismatch)?;
        let matches = state.direction == direction
            && state.token == claim.token
            && state.offer == claim.offer
            && state.peer.name() == peer
            && state.transferred == 0
            && state.channel.is_none()
            && state.phase == Phase::Negotiating;
        if !matches {
            return Err(TransferError::TokenMismatch);
        }

        let owner = owner.clone();
        if let Err(e) = self.open_storage(&owner) {
            let mut actions = vec![notify(&owner, TransferError::from(e).notice())];
            actions.extend(self.teardown(&owner, "StorageError", Some(&owner)));
            actions.push(TransferAction::CloseChannel { conn });
            return Ok((owner, actions));
        }

        let Some(state) = self.transfers.get_mut(&owner) else {
            return Err(TransferError::TokenMismatch);
        };
        state.channel = Some(conn);
        state.phase = Phase::ChannelOpen;
        let empty = state.offer.size == 0;
        self.channels.insert(conn, owner.clone());

        let actions = if empty { self.complete_empty(&owner) } else { Vec::new() };
        Ok((owner, actions))
    }

    fn open_storage(&mut self, owner: &str) -> Result<(), StorageError> {
        let Some(state) = self.transfers.get_mut(owner) else {
            return Ok(());
        };
        let Endpoint::Group(group) = &state.peer else {
            return Ok(());
        };

        state.storage = match state.direction {
            Direction::Send => {
                let (stored_name, writer) =
                    self.store.create_unique(group, &state.offer.filename)?;
                StorageEnd::Upload { stored_name, writer }
            },
            Direction::Receive => {
                StorageEnd::Download { reader: self.store.open_read(group, &state.offer.filename)? }
            },
        };
        Ok(())
    }

    fn complete_empty(&mut self, owner: &str) -> Vec<TransferAction> {
        let Some(state) = self.transfers.get(owner) else {
            return Vec::new();
        };
        let route = (state.peer.clone(), state.direction);

        let completed: Vec<String> = match route {
            (Endpoint::Group(_), Direction::Send) => return self.finish_put(owner),
            (Endpoint::Group(_), Direction::Receive) => vec![owner.to_string()],
            (Endpoint::User(peer), _) => {
                if self.transfers.get(&peer).is_some_and(|s| s.channel.is_some()) {
                    vec![owner.to_string(), peer]
                } else {
                    Vec::new()
                }
            },
        };
        for user in completed {
            if let Some(state) = self.transfers.get_mut(&user) {
                state.phase = Phase::Completed;
            }
        }
        Vec::new()
    }

    /// Readiness interest for a channel, `None` if `conn` is not one.
    pub fn interest(&self, conn: ConnId) -> Option<Interest> {
        let owner = self.channels.get(&conn)?;
        let state = self.transfers.get(owner)?;

        if state.phase == Phase::Completed {
            return Some(Interest::READ);
        }

        let interest = match (&state.peer, state.direction) {
            (Endpoint::User(receiver), Direction::Send) => Interest {
                read: state.piece.is_empty()
                    && state.remaining() > 0
                    && self.transfers.get(receiver).is_some_and(|s| s.channel.is_some()),
                write: false,
            },
            (Endpoint::User(sender), Direction::Receive) => Interest {
                read: true,
                write: self.transfers.get(sender).is_some_and(|s| !s.piece.is_empty()),
            },
            (Endpoint::Group(_), Direction::Send) => {
                Interest { read: state.remaining() > 0, write: false }
            },
            (Endpoint::Group(_), Direction::Receive) => {
                Interest { read: true, write: state.remaining() > 0 }
            },
        };
        Some(interest)
    }

    /// Handle read readiness on a channel.
    pub fn on_readable(&mut self, conn: ConnId, io: &mut impl ChannelIo) -> Vec<TransferAction> {
        let Some(owner) = self.channels.get(&conn).cloned() else {
            return Vec::new();
        };
        let Some(state) = self.transfers.get(&owner) else {
            return Vec::new();
        };

        let to_user = matches!(state.peer, Endpoint::User(_));

        match (to_user, state.direction, state.phase) {
            (_, _, Phase::Completed) | (_, Direction::Receive, _) => self.drain(conn, io),
            (true, Direction::Send, _) => self.pull_piece(&owner, conn, io),
            (false, Direction::Send, _) => self.pull_upload(&owner, conn, io),
        }
    }

    /// Handle write readiness on a channel.
    pub fn on_writable(&mut self, conn: ConnId, io: &mut impl ChannelIo) -> Vec<TransferAction> {
        let Some(owner) = self.channels.get(&conn).cloned() else {
            return Vec::new();
        };
        let Some(state) = self.transfers.get(&owner) else {
            return Vec::new();
        };

        let from_user = matches!(state.peer, Endpoint::User(_));

        match (from_user, state.direction, state.phase) {
            (_, _, Phase::Completed) | (_, Direction::Send, _) => Vec::new(),
            (true, Direction::Receive, _) => self.push_piece(&owner, io),
            (false, Direction::Receive, _) => self.push_download(&owner, conn, io),
        }
    }

    // Bytes arriving where none are expected are discarded; end of stream
    // tears the transfer down.
    fn drain(&mut self, conn: ConnId, io: &mut impl ChannelIo) -> Vec<TransferAction> {
        let mut scratch = [0u8; 512];
        loop {
            match io.read_raw(conn, &mut scratch) {
                Ok(Some(_)) => {},
                Ok(None) => return Vec::new(),
                Err(_) => return self.channel_closed(conn),
            }
        }
    }

    fn pull_piece(
        &mut self,
        sender: &str,
        conn: ConnId,
        io: &mut impl ChannelIo,
    ) -> Vec<TransferAction> {
        let Some(state) = self.transfers.get(sender) else {
            return Vec::new();
        };
        let Endpoint::User(receiver) = &state.peer else {
            return Vec::new();
        };
        let receiver = receiver.clone();
        let receiver_ready = self.transfers.get(&receiver).is_some_and(|s| s.channel.is_some());
        if !state.piece.is_empty() || state.remaining() == 0 || !receiver_ready {
            return Vec::new();
        }

        let want = piece_len(state.remaining());
        let mut buf = vec![0u8; want];
        let n = match io.read_raw(conn, &mut buf) {
            Ok(Some(n)) => n,
            Ok(None) => return Vec::new(),
            Err(_) => return self.channel_closed(conn),
        };
        buf.truncate(n);

        if let Some(state) = self.transfers.get_mut(sender) {
            state.piece.fill(buf);
            state.transferred += n as u64;
            state.phase = Phase::Forwarding;
        }
        if let Some(state) = self.transfers.get_mut(&receiver) {
            state.phase = Phase::Forwarding;
        }

        self.push_piece(&receiver, io)
    }

    fn push_piece(&mut self, receiver: &str, io: &mut impl ChannelIo) -> Vec<TransferAction> {
        let Some(state) = self.transfers.get(receiver) else {
            return Vec::new();
        };
        let (Some(conn), Endpoint::User(sender)) = (state.channel, &state.peer) else {
            return Vec::new();
        };
        let sender = sender.clone();
        let Some(source) = self.transfers.get_mut(&sender) else {
            return Vec::new();
        };

        let (written, failed) = write_piece(io, conn, &mut source.piece);
        if failed {
            return self.channel_closed(conn);
        }

        let mut complete = false;
        if let Some(state) = self.transfers.get_mut(receiver) {
            state.transferred += written as u64;
            complete = state.remaining() == 0;
        }
        if complete {
            for user in [receiver, sender.as_str()] {
                if let Some(state) = self.transfers.get_mut(user) {
                    state.phase = Phase::Completed;
                }
            }
        }
        Vec::new()
    }

    fn pull_upload(
        &mut self,
        owner: &str,
        conn: ConnId,
        io: &mut impl ChannelIo,
    ) -> Vec<TransferAction> {
        let Some(state) = self.transfers.get_mut(owner) else {
            return Vec::new();
        };
        if state.remaining() == 0 {
            return Vec::new();
        }

        let mut buf = vec![0u8; piece_len(state.remaining())];
        let n = match io.read_raw(conn, &mut buf) {
            Ok(Some(n)) => n,
            Ok(None) => return Vec::new(),
            Err(_) => return self.channel_closed(conn),
        };

        let StorageEnd::Upload { writer, .. } = &mut state.storage else {
            return Vec::new();
        };
        if writer.write_all(&buf[..n]).is_err() {
            let mut actions = vec![notify(owner, Notice::error(ErrorCode::Storage))];
            actions.extend(self.teardown(owner, "StorageError", Some(owner)));
            return actions;
        }

        state.transferred += n as u64;
        state.phase = Phase::Forwarding;
        if state.remaining() == 0 { self.finish_put(owner) } else { Vec::new() }
    }

    fn push_download(
        &mut self,
        owner: &str,
        conn: ConnId,
        io: &mut impl ChannelIo,
    ) -> Vec<TransferAction> {
        let Some(state) = self.transfers.get_mut(owner) else {
            return Vec::new();
        };
        if state.remaining() == 0 {
            return Vec::new();
        }

        if state.piece.is_empty() {
            let want = piece_len(state.remaining());
            let StorageEnd::Download { reader } = &mut state.storage else {
                return Vec::new();
            };
            match read_piece(reader, want) {
                Ok(piece) => state.piece.fill(piece),
                Err(_) => {
                    let mut actions = vec![notify(owner, Notice::error(ErrorCode::Storage))];
                    actions.extend(self.teardown(owner, "StorageError", Some(owner)));
                    return actions;
                },
            }
            state.phase = Phase::Forwarding;
        }

        let (written, failed) = write_piece(io, conn, &mut state.piece);
        if failed {
            return self.channel_closed(conn);
        }
        state.transferred += written as u64;
        if state.remaining() == 0 {
            state.phase = Phase::Completed;
        }
        Vec::new()
    }

    fn finish_put(&mut self, owner: &str) -> Vec<TransferAction> {
        let Some(state) = self.transfers.remove(owner) else {
            return Vec::new();
        };
        let TransferState { peer, offer, channel, storage, .. } = state;
        if let Some(conn) = channel {
            self.channels.remove(&conn);
        }
        let (Endpoint::Group(group), StorageEnd::Upload { stored_name, mut writer }) =
            (peer, storage)
        else {
            return Vec::new();
        };

        let flushed = writer.flush();
        drop(writer);
        let verified = flushed
            .map_err(StorageError::from)
            .and_then(|()| checksum(&self.store, &group, &stored_name));

        let mut actions = Vec::new();
        match verified {
            Ok(crc) if crc == offer.crc => actions.push(TransferAction::FileStored {
                group,
                uploader: owner.to_string(),
                filename: stored_name,
                size: offer.size,
                crc,
            }),
            Ok(_) => {
                let _ = self.store.remove(&group, &stored_name);
                actions.push(notify(
                    owner,
                    Notice::error_with(ErrorCode::ChecksumMismatch, offer.filename),
                ));
            },
            Err(e) => {
                let _ = self.store.remove(&group, &stored_name);
                actions.push(notify(owner, TransferError::from(e).notice()));
            },
        }

        if let Some(conn) = channel {
            actions.push(TransferAction::CloseChannel { conn });
        }
        actions
    }

    /// A channel connection is gone.
    ///
    /// A completed pair is cleared silently; anything else is a teardown with
    /// both users notified. Unknown connections are ignored.
    pub fn channel_closed(&mut self, conn: ConnId) -> Vec<TransferAction> {
        let Some(owner) = self.channels.remove(&conn) else {
            return Vec::new();
        };
        let Some(state) = self.transfers.get_mut(&owner) else {
            return Vec::new();
        };
        state.channel = None;

        if state.phase == Phase::Completed {
            let mut actions = Vec::new();
            for user in self.participants(&owner) {
                if let Some(state) = self.transfers.remove(&user) {
                    actions.extend(self.release(state));
                }
            }
            return actions;
        }

        self.teardown(&owner, "ChannelClosed", None)
    }

    /// The user's session is gone; its transfer and any offer addressed to it
    /// are torn down.
    pub fn user_gone(&mut self, user: &str) -> Vec<TransferAction> {
        let mut owners: Vec<String> = self
            .transfers
            .iter()
            .filter(|(_, state)| state.peer.is_user(user))
            .map(|(owner, _)| owner.clone())
            .collect();
        if self.transfers.contains_key(user) {
            owners.insert(0, user.to_string());
        }

        let mut actions = Vec::new();
        for owner in owners {
            if self.transfers.contains_key(&owner) {
                actions.extend(self.teardown(&owner, "Disconnected", Some(user)));
            }
        }
        actions
    }

    /// A group was deleted; transfers into or out of it are torn down.
    pub fn group_deleted(&mut self, group: &str) -> Vec<TransferAction> {
        let owners: Vec<String> = self
            .transfers
            .iter()
            .filter(|(_, state)| state.peer == Endpoint::Group(group.to_string()))
            .map(|(owner, _)| owner.clone())
            .collect();

        owners.iter().flat_map(|owner| self.teardown(owner, "GroupDeleted", None)).collect()
    }

    /// Expire every invite whose deadline has passed.
    pub fn expire_due(&mut self, now: I) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        for (id, owner) in self.timers.pop_expired(now) {
            let live = self
                .transfers
                .get(&owner)
                .is_some_and(|s| s.timer == Some(id) && s.phase == Phase::Requested);
            if !live {
                continue;
            }
            if let Some(state) = self.transfers.get_mut(&owner) {
                state.timer = None;
            }
            actions.extend(self.teardown(&owner, "Expired", None));
        }
        actions
    }

    /// Users taking part in `owner`'s transfer, owner first.
    fn participants(&self, owner: &str) -> Vec<String> {
        let mut users = vec![owner.to_string()];
        if let Some(Endpoint::User(peer)) = self.transfers.get(owner).map(|s| &s.peer) {
            users.push(peer.clone());
        }
        users
    }

    /// Remove both sides of `owner`'s transfer, notifying every participant
    /// except `initiator` with `!cancelfile`.
    fn teardown(
        &mut self,
        owner: &str,
        reason: &str,
        initiator: Option<&str>,
    ) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        let Some(state) = self.transfers.remove(owner) else {
            return actions;
        };

        let peer = state.peer.clone();
        if Some(owner) != initiator {
            actions.push(notify(owner, Notice::CancelFile {
                user: peer.name().to_string(),
                reason: reason.to_string(),
            }));
        }
        actions.extend(self.release(state));

        if let Endpoint::User(peer) = peer {
            if Some(peer.as_str()) != initiator {
                actions.push(notify(&peer, Notice::CancelFile {
                    user: owner.to_string(),
                    reason: reason.to_string(),
                }));
            }
            let paired = self.transfers.get(&peer).is_some_and(|s| s.peer.is_user(owner));
            if paired {
                if let Some(state) = self.transfers.remove(&peer) {
                    actions.extend(self.release(state));
                }
            }
        }
        actions
    }

    /// Free everything a removed state holds.
    fn release(&mut self, state: TransferState<F>) -> Vec<TransferAction> {
        let mut actions = Vec::new();
        if let Some(timer) = state.timer {
            self.timers.cancel(timer);
        }
        if let Some(conn) = state.channel {
            self.channels.remove(&conn);
            actions.push(TransferAction::CloseChannel { conn });
        }
        if let (Endpoint::Group(group), StorageEnd::Upload { stored_name, writer }) =
            (&state.peer, state.storage)
        {
            drop(writer);
            let _ = self.store.remove(group, &stored_name);
        }
        actions
    }
}

fn piece_len(remaining: u64) -> usize {
    usize::try_from(remaining).map_or(PIECE_SIZE, |remaining| remaining.min(PIECE_SIZE))
}

/// Write as much of `piece` as the channel takes. Returns bytes written and
/// whether the channel failed.
fn write_piece(io: &mut impl ChannelIo, conn: ConnId, piece: &mut PieceBuffer) -> (usize, bool) {
    let mut written = 0;
    while !piece.is_empty() {
        match io.write_raw(conn, piece.pending()) {
            Ok(Some(n)) if n > 0 => {
                piece.advance(n);
                written += n;
            },
            Ok(_) => break,
            Err(_) => return (written, true),
        }
    }
    (written, false)
}

fn read_piece(reader: &mut impl Read, len: usize) -> Result<Vec<u8>, StorageError> {
    let mut piece = vec![0u8; len];
    let mut filled = 0;
    while filled < len {
        match reader.read(&mut piece[filled..])? {
            0 => return Err(StorageError::Io("stored file is shorter than recorded".into())),
            n => filled += n,
        }
    }
    Ok(piece)
}

fn checksum<F: FileStore>(store: &F, group: &str, name: &str) -> Result<u32, StorageError> {
    let mut reader = store.open_read(group, name)?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; PIECE_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
