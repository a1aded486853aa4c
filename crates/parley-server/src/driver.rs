//! Server driver.
//!
//! Ties together the connection registry, group manager, transfer relay and
//! file store. The driver is sans-IO: the runtime feeds it readiness events and
//! executes the actions it returns. Sockets are only touched through
//! non-blocking `try_read` / `try_write`.

use std::{
    collections::{BTreeSet, VecDeque},
    net::SocketAddr,
    time::Duration,
};

use bytes::Bytes;
use parley_core::{ConnectionError, Environment, Socket};
use parley_proto::{ChannelClaim, Command, ErrorCode, Notice, frame::MAX_LONG_MESSAGE_SIZE};

use crate::{
    admin::{AdminCommand, BanTarget},
    group_manager::{Actor, GroupAction, GroupError, GroupFlags, GroupManager, LOBBY},
    registry::{ConnId, ConnectionRegistry, Interest, RegistryError, Role},
    server_error::DriverError,
    storage::FileStore,
    transfer::{Direction, TOKEN_LEN, TransferAction, TransferError, TransferRelay},
};

/// Driver configuration
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// How long a `!sendfile` offer waits for an answer
    pub invite_timeout: Duration,
    /// Messages queued per connection before it is dropped as a slow reader
    pub outbox_capacity: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            invite_timeout: Duration::from_secs(30),
            outbox_capacity: 256,
        }
    }
}

/// Readiness reported by the runtime for one connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    /// The peer hung up or the socket errored
    pub hangup: bool,
    /// Bytes can be read
    pub readable: bool,
    /// Bytes can be written
    pub writable: bool,
}

impl Readiness {
    /// Readable only.
    pub const READABLE: Self = Self { hangup: false, readable: true, writable: false };
    /// Writable only.
    pub const WRITABLE: Self = Self { hangup: false, readable: false, writable: true };
    /// Hangup only.
    pub const HANGUP: Self = Self { hangup: true, readable: false, writable: false };
}

/// Events that the server driver processes.
///
/// These are produced by the external runtime (production or tests).
#[derive(Debug)]
pub enum ServerEvent<S> {
    /// A new connection was accepted
    ConnectionAccepted {
        /// Unique connection ID assigned by the runtime
        conn_id: ConnId,
        /// Remote address
        peer: SocketAddr,
        /// Non-blocking socket
        socket: S,
    },

    /// A connection became ready
    Ready {
        /// Connection
        conn_id: ConnId,
        /// What it is ready for
        readiness: Readiness,
    },

    /// Periodic tick for invite expiry
    Tick,

    /// Operator console command
    Admin(AdminCommand),
}

/// Actions that the server driver produces.
///
/// These are executed by runtime-specific code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerAction {
    /// Change what the runtime waits for on a connection
    SetInterest {
        /// Connection
        conn_id: ConnId,
        /// New interest
        interest: Interest,
    },

    /// Close a connection. The driver has already forgotten it.
    Close {
        /// Connection to close
        conn_id: ConnId,
        /// Reason for closure
        reason: String,
    },

    /// Stop accepting and exit
    Shutdown,

    /// Log a message (for debugging/monitoring)
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
    },
}

/// Log levels for server actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Action-based server driver.
///
/// Orchestrates connection management, group operations, message routing and
/// file transfers.
pub struct ServerDriver<E, S, F>
where
    E: Environment,
    S: Socket,
    F: FileStore,
{
    /// Connections, sessions and outboxes
    registry: ConnectionRegistry<S>,
    /// Groups and memberships
    groups: GroupManager,
    /// Transfer state machines and channels
    relay: TransferRelay<F, E::Instant>,
    /// Storage backend (shared with the relay)
    store: F,
    /// Environment (time, RNG)
    env: E,
    /// Driver configuration
    config: DriverConfig,
    /// Actions produced by the event being processed
    actions: Vec<ServerAction>,
    /// Connections to disconnect once the current event is handled
    doomed: VecDeque<(ConnId, String)>,
    /// Connections whose interest may have changed
    touched: BTreeSet<ConnId>,
}

impl<E, S, F> ServerDriver<E, S, F>
where
    E: Environment,
    S: Socket,
    F: FileStore,
{
    /// Create a new server driver.
    pub fn new(env: E, store: F, config: DriverConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(config.outbox_capacity, config.max_connections),
            groups: GroupManager::new(),
            relay: TransferRelay::new(store.clone()),
            store,
            env,
            config,
            actions: Vec::new(),
            doomed: VecDeque::new(),
            touched: BTreeSet::new(),
        }
    }

    /// Process a server event and return actions to execute.
    ///
    /// This is the main entry point for the server driver.
    ///
    /// # Errors
    ///
    /// - `DriverError::ConnectionNotFound` for readiness on a forgotten
    ///   connection
    /// - `DriverError::ConnectionAlreadyExists` if the runtime reused an id
    pub fn process_event(
        &mut self,
        event: ServerEvent<S>,
    ) -> Result<Vec<ServerAction>, DriverError> {
        let result = match event {
            ServerEvent::ConnectionAccepted { conn_id, peer, socket } => {
                self.handle_accept(conn_id, peer, socket)
            },
            ServerEvent::Ready { conn_id, readiness } => self.handle_ready(conn_id, readiness),
            ServerEvent::Tick => {
                self.handle_tick();
                Ok(())
            },
            ServerEvent::Admin(command) => {
                self.handle_admin(command);
                Ok(())
            },
        };

        self.reap();
        self.refresh_interest();
        let actions = std::mem::take(&mut self.actions);
        result.map(|()| actions)
    }

    fn handle_accept(&mut self, conn_id: ConnId, peer: SocketAddr, socket: S) -> Result<(), DriverError> {
        match self.registry.accept(conn_id, peer, socket) {
            Ok(()) => {
                self.log(LogLevel::Debug, format!("connection {conn_id} accepted from {peer}"));
                Ok(())
            },
            Err(RegistryError::ConnectionExists(id)) => Err(DriverError::ConnectionAlreadyExists(id)),
            Err(e) => {
                self.log(LogLevel::Info, format!("refusing connection from {peer}: {e}"));
                self.actions.push(ServerAction::Close { conn_id, reason: e.to_string() });
                Ok(())
            },
        }
    }

    /// Hangup wins over readable, readable over writable.
    fn handle_ready(&mut self, conn_id: ConnId, readiness: Readiness) -> Result<(), DriverError> {
        if self.registry.entry(conn_id).is_none() {
            return Err(DriverError::ConnectionNotFound(conn_id));
        }
        self.touched.insert(conn_id);

        if readiness.hangup {
            self.disconnect(conn_id, "peer hung up");
            return Ok(());
        }

        if self.relay.is_channel(conn_id) {
            if readiness.readable {
                let actions = self.relay.on_readable(conn_id, &mut self.registry);
                self.apply_transfer_actions(actions);
            }
            if readiness.writable && self.relay.is_channel(conn_id) {
                let actions = self.relay.on_writable(conn_id, &mut self.registry);
                self.apply_transfer_actions(actions);
            }
            return Ok(());
        }

        if readiness.readable {
            self.read_messages(conn_id);
        }
        if readiness.writable && !self.is_doomed(conn_id) {
            if let Err(e) = self.registry.flush(conn_id) {
                self.doom(conn_id, format!("write failed: {e}"));
            }
        }
        Ok(())
    }

    fn read_messages(&mut self, conn_id: ConnId) {
        loop {
            if self.is_doomed(conn_id) || self.relay.is_channel(conn_id) {
                return;
            }
            let Some(entry) = self.registry.entry_mut(conn_id) else {
                return;
            };

            match entry.conn.receive_message() {
                Ok(Some(payload)) => self.dispatch(conn_id, &payload),
                Ok(None) => return,
                Err(ConnectionError::Protocol(e)) => {
                    self.log(LogLevel::Debug, format!("connection {conn_id}: {e}"));
                    self.reply(conn_id, Notice::error(ErrorCode::BadFrame));
                },
                Err(ConnectionError::Closed) => {
                    self.doom(conn_id, "peer closed".to_string());
                    return;
                },
                Err(e) => {
                    self.doom(conn_id, format!("read failed: {e}"));
                    return;
                },
            }
        }
    }

    fn dispatch(&mut self, conn_id: ConnId, payload: &[u8]) {
        let command = match Command::parse(payload) {
            Ok(command) => command,
            Err(e) => {
                let code = if e.is_framing() { ErrorCode::BadFrame } else { ErrorCode::BadCommand };
                self.reply(conn_id, Notice::error_with(code, e.to_string()));
                return;
            },
        };

        let session = match self.registry.role(conn_id) {
            Some(Role::User(session)) => Some((session.name.clone(), session.admin)),
            Some(Role::Unregistered) => None,
            Some(Role::TransferChannel { .. }) | None => return,
        };

        match (session, command) {
            (_, Command::Close) => self.doom(conn_id, "client closed".to_string()),
            (None, Command::Register { username }) => self.handle_register(conn_id, &username),
            (None, Command::TransferSend(claim)) => {
                self.handle_channel(conn_id, &claim, Direction::Send);
            },
            (None, Command::TransferReceive(claim)) => {
                self.handle_channel(conn_id, &claim, Direction::Receive);
            },
            (None, _) => self.reply(conn_id, Notice::error(ErrorCode::NotRegistered)),
            (Some((name, admin)), command) => {
                self.handle_user_command(conn_id, &name, admin, command);
            },
        }
    }

    fn handle_register(&mut self, conn_id: ConnId, requested: &str) {
        let name = match self.registry.register_user(conn_id, requested) {
            Ok(name) => name,
            Err(e) => {
                let notice = match &e {
                    RegistryError::InvalidName(name) | RegistryError::NameExhausted(name) => {
                        Notice::error_with(e.code(), name.clone())
                    },
                    _ => Notice::error(e.code()),
                };
                self.reply(conn_id, notice);
                self.doom(conn_id, format!("registration failed: {e}"));
                return;
            },
        };

        let others: Vec<String> =
            self.registry.usernames().into_iter().filter(|user| *user != name).collect();
        self.fan_out(&others, &Notice::UserOnline { user: name.clone() });

        self.reply(conn_id, Notice::RegReply { username: name.clone() });
        self.reply(conn_id, Notice::UserList { group: None, users: self.registry.usernames() });

        match self.groups.join(&name, LOBBY) {
            Ok(actions) => self.apply_group_actions(actions),
            Err(e) => self.log(LogLevel::Error, format!("{name} could not join {LOBBY}: {e}")),
        }
        self.log(LogLevel::Info, format!("connection {conn_id} registered as {name}"));
    }

    fn handle_channel(&mut self, conn_id: ConnId, claim: &ChannelClaim, direction: Direction) {
        match self.relay.register_channel(conn_id, claim, direction) {
            Ok((owner, actions)) => {
                if let Err(e) = self.registry.mark_channel(conn_id, &owner) {
                    self.log(LogLevel::Warn, format!("connection {conn_id}: {e}"));
                }
                self.log(LogLevel::Debug, format!("connection {conn_id} carries {owner}'s transfer"));
                self.apply_transfer_actions(actions);
            },
            Err(e) => {
                self.reply(conn_id, e.notice());
                self.doom(conn_id, format!("channel rejected: {e}"));
            },
        }
    }

    fn handle_user_command(&mut self, conn_id: ConnId, user: &str, admin: bool, command: Command) {
        let actor = Actor { name: user, admin };

        match command {
            Command::Register { .. } => {
                self.reply(conn_id, Notice::error(ErrorCode::AlreadyRegistered));
            },
            Command::TransferSend(_) | Command::TransferReceive(_) => {
                self.reply(
                    conn_id,
                    Notice::error_with(ErrorCode::BadCommand, "channel claim on a session"),
                );
            },
            Command::DirectMessage { to, text } => {
                let notice = Notice::PrivateMessage { from: user.to_string(), text };
                let Some(message) = self.chat_bytes(conn_id, &notice) else {
                    return;
                };
                let delivered = match self.registry.conn_for_user(&to) {
                    Some(target) => self.send_bytes(target, message),
                    None => false,
                };
                if !delivered {
                    self.reply(conn_id, Notice::error_with(ErrorCode::UserNotFound, to));
                }
            },
            Command::GroupMessage { group, text } => {
                match self.groups.talk_recipients(actor, &group) {
                    Ok(recipients) => {
                        let notice = Notice::GroupMessage { group, from: user.to_string(), text };
                        if let Some(message) = self.chat_bytes(conn_id, &notice) {
                            self.fan_out_bytes(&recipients, message);
                        }
                    },
                    Err(e) => self.reply(conn_id, e.notice()),
                }
            },
            Command::Broadcast { text } => {
                let notice = Notice::PublicMessage { from: user.to_string(), text };
                let Some(message) = self.chat_bytes(conn_id, &notice) else {
                    return;
                };
                let others: Vec<String> =
                    self.registry.usernames().into_iter().filter(|name| name != user).collect();
                self.fan_out_bytes(&others, message);
            },
            Command::UserList { group: None } => {
                let users = self.registry.usernames();
                self.reply(conn_id, Notice::UserList { group: None, users });
            },
            Command::UserList { group: Some(group) } => match self.groups.members(&group) {
                Ok(users) => self.reply(conn_id, Notice::UserList { group: Some(group), users }),
                Err(e) => self.reply(conn_id, e.notice()),
            },
            Command::NewGroup { name, invitees, invite_only } => {
                let mut flags = GroupFlags::TRANSFER_ALLOWED;
                if invite_only {
                    flags = flags.with(GroupFlags::INVITE_ONLY);
                }
                let registry = &self.registry;
                let result = self.groups.create_with_flags(user, &name, &invitees, flags, |u| {
                    registry.is_online(u)
                });
                self.apply_group_result(conn_id, result);
            },
            Command::JoinGroup { name } => {
                let result = self.groups.join(user, &name);
                self.apply_group_result(conn_id, result);
            },
            Command::LeaveGroup { name } => {
                let result = self.groups.leave(user, &name);
                self.apply_group_result(conn_id, result);
            },
            Command::InviteGroup { name, users } => {
                let registry = &self.registry;
                let result = self.groups.invite(actor, &name, &users, |u| registry.is_online(u));
                self.apply_group_result(conn_id, result);
            },
            Command::KickGroup { name, users } => {
                let result = self.groups.kick(actor, &name, &users);
                self.apply_group_result(conn_id, result);
            },
            Command::SendFile { offer, target } => {
                let token = self.env.token(TOKEN_LEN);
                let deadline = self.env.now() + self.config.invite_timeout;
                let registry = &self.registry;
                let result = self.relay.request(
                    user,
                    target.as_deref(),
                    offer,
                    token,
                    |u| registry.is_online(u),
                    deadline,
                );
                self.apply_transfer_result(conn_id, result);
            },
            Command::AcceptFile { offer, sender, token } => {
                let result = self.relay.accept(user, &sender, &offer, &token);
                self.apply_transfer_result(conn_id, result);
            },
            Command::RejectFile { user: sender, reason } => {
                let result = self.relay.reject(user, &sender, &reason);
                self.apply_transfer_result(conn_id, result);
            },
            Command::CancelFile { user: counterpart, reason } => {
                let result = self.relay.cancel(user, &counterpart, &reason);
                self.apply_transfer_result(conn_id, result);
            },
            Command::PutFile { group, offer } => {
                if let Err(e) = self.groups.authorize_put(actor, &group) {
                    self.reply(conn_id, e.notice());
                    return;
                }
                let token = self.env.token(TOKEN_LEN);
                let result = self.relay.begin_put(user, &group, offer, token);
                self.apply_transfer_result(conn_id, result);
            },
            Command::GetFile { group, file_id } => {
                let file = match self.groups.authorize_get(actor, &group, file_id) {
                    Ok(file) => file,
                    Err(e) => {
                        self.reply(conn_id, e.notice());
                        return;
                    },
                };
                let token = self.env.token(TOKEN_LEN);
                let result = self.relay.begin_get(user, &group, &file, token);
                self.apply_transfer_result(conn_id, result);
            },
            Command::FileList { group } => match self.groups.file_list(actor, &group) {
                Ok(notice) => self.reply(conn_id, notice),
                Err(e) => self.reply(conn_id, e.notice()),
            },
            Command::RemoveFile { group, file_id } => {
                let result = self.groups.remove_file(actor, &group, file_id);
                self.apply_group_result(conn_id, result);
            },
            Command::BanGroup { .. } => {
                self.reply(conn_id, Notice::error_with(ErrorCode::Unsupported, "bangroup"));
            },
            Command::SetPermission { .. } => {
                self.reply(conn_id, Notice::error_with(ErrorCode::Unsupported, "setperm"));
            },
            Command::Close => self.doom(conn_id, "client closed".to_string()),
        }
    }

    fn handle_tick(&mut self) {
        let actions = self.relay.expire_due(self.env.now());
        if !actions.is_empty() {
            self.log(LogLevel::Debug, "transfer invites expired".to_string());
        }
        self.apply_transfer_actions(actions);
    }

    fn handle_admin(&mut self, command: AdminCommand) {
        match command {
            AdminCommand::Shutdown => {
                for conn_id in self.registry.conn_ids() {
                    self.registry.remove(conn_id);
                    self.relay.channel_closed(conn_id);
                    self.actions.push(ServerAction::Close {
                        conn_id,
                        reason: "server shutdown".to_string(),
                    });
                }
                self.doomed.clear();
                self.log(LogLevel::Info, "shutdown requested".to_string());
                self.actions.push(ServerAction::Shutdown);
            },
            AdminCommand::Broadcast(text) => {
                let users = self.registry.usernames();
                self.fan_out(&users, &Notice::AdminMessage { text });
            },
            AdminCommand::DeleteGroup(name) => match self.groups.delete_group(&name) {
                Ok(actions) => {
                    self.apply_group_actions(actions);
                    self.log(LogLevel::Info, format!("group {name} deleted"));
                },
                Err(e) => self.log(LogLevel::Warn, format!("cannot delete {name}: {e}")),
            },
            AdminCommand::DropUser(name) => match self.registry.conn_for_user(&name) {
                Some(conn_id) => self.doom(conn_id, "dropped by operator".to_string()),
                None => self.log(LogLevel::Warn, format!("no user named {name}")),
            },
            AdminCommand::Ban(target) => {
                let Some(ip) = self.ban_address(&target) else {
                    return;
                };
                self.registry.ban(ip);
                for conn_id in self.registry.conns_from(ip) {
                    self.doom(conn_id, "banned".to_string());
                }
                self.log(LogLevel::Info, format!("banned {ip}"));
            },
            AdminCommand::Unban(target) => {
                let Some(ip) = self.ban_address(&target) else {
                    return;
                };
                if self.registry.unban(ip) {
                    self.log(LogLevel::Info, format!("unbanned {ip}"));
                } else {
                    self.log(LogLevel::Warn, format!("{ip} was not banned"));
                }
            },
            AdminCommand::Promote(name) => self.set_admin(&name, true),
            AdminCommand::Demote(name) => self.set_admin(&name, false),
            AdminCommand::LobbyMessage(text) => {
                let members = self.groups.members(LOBBY).unwrap_or_default();
                let notice =
                    Notice::GroupMessage { group: LOBBY.to_string(), from: "admin".to_string(), text };
                self.fan_out(&members, &notice);
            },
        }
    }

    /// An online user name wins over DNS.
    fn ban_address(&mut self, target: &BanTarget) -> Option<std::net::IpAddr> {
        let by_user = self
            .registry
            .conn_for_user(&target.name)
            .and_then(|conn_id| self.registry.entry(conn_id))
            .map(|entry| entry.peer.ip());
        let ip = by_user.or(target.resolved);
        if ip.is_none() {
            self.log(LogLevel::Warn, format!("cannot resolve {}", target.name));
        }
        ip
    }

    fn set_admin(&mut self, name: &str, admin: bool) {
        let Some(session) = self.registry.user_by_name_mut(name) else {
            self.log(LogLevel::Warn, format!("no user named {name}"));
            return;
        };
        session.admin = admin;
        let notice = if admin { Notice::Promoted } else { Notice::Demoted };
        self.send_to_user(name, &notice);
    }

    fn apply_group_result(
        &mut self,
        conn_id: ConnId,
        result: Result<Vec<GroupAction>, GroupError>,
    ) {
        match result {
            Ok(actions) => self.apply_group_actions(actions),
            Err(e) => self.reply(conn_id, e.notice()),
        }
    }

    fn apply_group_actions(&mut self, actions: Vec<GroupAction>) {
        for action in actions {
            match action {
                GroupAction::Notify { recipients, notice } => self.fan_out(&recipients, &notice),
                GroupAction::Joined { group, user } => {
                    if let Some(session) = self.registry.user_by_name_mut(&user) {
                        session.groups.insert(group);
                    }
                },
                GroupAction::Left { group, user } => {
                    if let Some(session) = self.registry.user_by_name_mut(&user) {
                        session.groups.remove(&group);
                    }
                },
                GroupAction::Deleted { group, members } => {
                    for member in &members {
                        if let Some(session) = self.registry.user_by_name_mut(member) {
                            session.groups.remove(&group);
                        }
                    }
                    let actions = self.relay.group_deleted(&group);
                    self.apply_transfer_actions(actions);
                    if let Err(e) = self.store.remove_group(&group) {
                        self.log(LogLevel::Error, format!("cannot remove files of {group}: {e}"));
                    }
                },
                GroupAction::DiscardFile { group, filename } => {
                    if let Err(e) = self.store.remove(&group, &filename) {
                        self.log(LogLevel::Error, format!("cannot remove {group}/{filename}: {e}"));
                    }
                },
            }
        }
    }

    fn apply_transfer_result(
        &mut self,
        conn_id: ConnId,
        result: Result<Vec<TransferAction>, TransferError>,
    ) {
        match result {
            Ok(actions) => self.apply_transfer_actions(actions),
            Err(e) => self.reply(conn_id, e.notice()),
        }
    }

    fn apply_transfer_actions(&mut self, actions: Vec<TransferAction>) {
        for action in actions {
            match action {
                TransferAction::Notify { user, notice } => {
                    self.send_to_user(&user, &notice);
                },
                TransferAction::CloseChannel { conn } => {
                    self.doom(conn, "transfer finished".to_string());
                },
                TransferAction::FileStored { group, uploader, filename, size, crc } => {
                    match self.groups.add_file(&group, &uploader, &filename, size, crc) {
                        Ok(actions) => self.apply_group_actions(actions),
                        Err(e) => {
                            self.log(LogLevel::Warn, format!("dropping upload {filename}: {e}"));
                            if let Err(e) = self.store.remove(&group, &filename) {
                                self.log(
                                    LogLevel::Error,
                                    format!("cannot remove {group}/{filename}: {e}"),
                                );
                            }
                        },
                    }
                },
            }
        }
    }

    /// Forget a connection and clean up after it. Idempotent.
    fn disconnect(&mut self, conn_id: ConnId, reason: &str) {
        let Some(entry) = self.registry.remove(conn_id) else {
            return;
        };
        self.touched.remove(&conn_id);
        self.actions.push(ServerAction::Close { conn_id, reason: reason.to_string() });
        self.log(LogLevel::Debug, format!("connection {conn_id} closed: {reason}"));

        match entry.role {
            Role::User(session) => {
                let actions = self.relay.user_gone(&session.name);
                self.apply_transfer_actions(actions);

                let actions = self.groups.remove_user(&session.name);
                self.apply_group_actions(actions);

                let users = self.registry.usernames();
                self.fan_out(&users, &Notice::UserOffline { user: session.name.clone() });
                self.log(LogLevel::Info, format!("{} went offline", session.name));
            },
            Role::TransferChannel { .. } | Role::Unregistered => {
                let actions = self.relay.channel_closed(conn_id);
                self.apply_transfer_actions(actions);
            },
        }
    }

    fn doom(&mut self, conn_id: ConnId, reason: String) {
        if !self.is_doomed(conn_id) {
            self.doomed.push_back((conn_id, reason));
        }
    }

    fn is_doomed(&self, conn_id: ConnId) -> bool {
        self.doomed.iter().any(|(id, _)| *id == conn_id)
    }

    fn reap(&mut self) {
        while let Some((conn_id, reason)) = self.doomed.pop_front() {
            self.disconnect(conn_id, &reason);
        }
    }

    fn refresh_interest(&mut self) {
        let mut conns = std::mem::take(&mut self.touched);
        conns.extend(self.relay.channel_ids());

        for conn_id in conns {
            let interest = match self.registry.role(conn_id) {
                None => continue,
                Some(Role::TransferChannel { .. }) => {
                    self.relay.interest(conn_id).unwrap_or(Interest::READ)
                },
                Some(_) => self.registry.framed_interest(conn_id),
            };
            if self.registry.set_interest(conn_id, interest) {
                self.actions.push(ServerAction::SetInterest { conn_id, interest });
            }
        }
    }

    fn reply(&mut self, conn_id: ConnId, notice: Notice) {
        self.send_bytes(conn_id, notice.to_bytes());
    }

    fn send_bytes(&mut self, conn_id: ConnId, message: Bytes) -> bool {
        if self.is_doomed(conn_id) {
            return false;
        }
        self.touched.insert(conn_id);
        match self.registry.enqueue(conn_id, message) {
            Ok(()) => true,
            Err(RegistryError::UnknownConnection(_)) => false,
            Err(e @ RegistryError::MessageTooLarge { .. }) => {
                self.log(LogLevel::Warn, format!("dropped outbound message: {e}"));
                false
            },
            Err(e) => {
                self.doom(conn_id, format!("send failed: {e}"));
                false
            },
        }
    }

    /// Returns false if the user is not online.
    fn send_to_user(&mut self, user: &str, notice: &Notice) -> bool {
        match self.registry.conn_for_user(user) {
            Some(conn_id) => self.send_bytes(conn_id, notice.to_bytes()),
            None => false,
        }
    }

    /// Encode a chat notice, or tell the sender it cannot be framed.
    fn chat_bytes(&mut self, conn_id: ConnId, notice: &Notice) -> Option<Bytes> {
        let message = notice.to_bytes();
        if message.len() > MAX_LONG_MESSAGE_SIZE {
            self.reply(conn_id, Notice::error_with(ErrorCode::BadCommand, "message too long"));
            return None;
        }
        Some(message)
    }

    /// Best-effort delivery; failures are logged once per fan-out.
    fn fan_out(&mut self, recipients: &[String], notice: &Notice) {
        if !recipients.is_empty() {
            self.fan_out_bytes(recipients, notice.to_bytes());
        }
    }

    fn fan_out_bytes(&mut self, recipients: &[String], message: Bytes) {
        if recipients.is_empty() {
            return;
        }
        let mut failed = 0usize;
        for user in recipients {
            let delivered = match self.registry.conn_for_user(user) {
                Some(conn_id) => self.send_bytes(conn_id, message.clone()),
                None => false,
            };
            if !delivered {
                failed += 1;
            }
        }
        if failed > 0 {
            self.log(
                LogLevel::Warn,
                format!("{failed} of {} recipients missed a notice", recipients.len()),
            );
        }
    }

    fn log(&mut self, level: LogLevel, message: String) {
        self.actions.push(ServerAction::Log { level, message });
    }

    /// Connections, sessions and bans.
    pub fn registry(&self) -> &ConnectionRegistry<S> {
        &self.registry
    }

    /// Groups and memberships.
    pub fn groups(&self) -> &GroupManager {
        &self.groups
    }

    /// Transfer state.
    pub fn relay(&self) -> &TransferRelay<F, E::Instant> {
        &self.relay
    }

    /// File storage backend.
    pub fn store(&self) -> &F {
        &self.store
    }

    /// Environment (time, RNG).
    pub fn env(&self) -> &E {
        &self.env
    }

    /// Get the number of active connections.
    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }
}

impl<E, S, F> std::fmt::Debug for ServerDriver<E, S, F>
where
    E: Environment,
    S: Socket,
    F: FileStore,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerDriver")
            .field("connections", &self.registry.len())
            .field("users", &self.registry.user_count())
            .field("groups", &self.groups.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
