//! Group Manager
//!
//! Owns every group, its memberships and its file index. Operations return
//! [`GroupAction`]s for the driver to execute; the manager itself never touches
//! connections or storage.
//!
//! A membership with the `JOINED` bit clear is an outstanding invitation. Only
//! joined members receive group traffic. A group left without any membership,
//! joined or invited, is deleted unless it is persistent (the lobby).

use std::collections::BTreeMap;

use parley_proto::{ErrorCode, FileListing, Notice};

use crate::registry::is_valid_name;

/// Name of the persistent group every user joins on registration.
pub const LOBBY: &str = "lobby";

/// Per-member permission bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Permissions(u8);

impl Permissions {
    /// No rights (outstanding invitation)
    pub const NONE: Self = Self(0);
    /// Membership is active
    pub const JOINED: Self = Self(1);
    /// May post group messages
    pub const TALK: Self = Self(1 << 1);
    /// May invite users
    pub const INVITE: Self = Self(1 << 2);
    /// May upload files
    pub const PUT_FILE: Self = Self(1 << 3);
    /// May list and download files
    pub const GET_FILE: Self = Self(1 << 4);
    /// May kick members and remove any file
    pub const KICK: Self = Self(1 << 5);
    /// May change permissions
    pub const SET_PERM: Self = Self(1 << 6);
    /// Founder rights
    pub const ALL: Self = Self(0x7f);
    /// Rights of a member who joined an open group or accepted an invite
    pub const OPEN_JOIN: Self = Self(
        Self::JOINED.0 | Self::TALK.0 | Self::INVITE.0 | Self::PUT_FILE.0 | Self::GET_FILE.0,
    );

    /// True if every bit of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if the membership is active.
    pub fn is_joined(self) -> bool {
        self.contains(Self::JOINED)
    }

    /// Raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }
}

/// Group-level flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupFlags(u8);

impl GroupFlags {
    /// Never deleted when it empties
    pub const PERSISTENT: Self = Self(1);
    /// Only invited users may join
    pub const INVITE_ONLY: Self = Self(1 << 1);
    /// Uploads and downloads are permitted
    pub const TRANSFER_ALLOWED: Self = Self(1 << 2);

    /// Union of two flag sets.
    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True if every flag of `other` is set.
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

/// A file stored in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupFile {
    /// Group-unique id, never reused
    pub id: u32,
    /// Uploading user
    pub uploader: String,
    /// Name in storage (after de-duplication)
    pub filename: String,
    /// Size in bytes
    pub size: u64,
    /// CRC-32 of the content
    pub crc: u32,
}

/// A chat group.
#[derive(Debug, Clone)]
pub struct Group {
    name: String,
    flags: GroupFlags,
    members: BTreeMap<String, Permissions>,
    files: BTreeMap<u32, GroupFile>,
    next_file_id: u32,
}

impl Group {
    fn new(name: &str, flags: GroupFlags) -> Self {
        Self {
            name: name.to_string(),
            flags,
            members: BTreeMap::new(),
            files: BTreeMap::new(),
            next_file_id: 1,
        }
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Group flags.
    pub fn flags(&self) -> GroupFlags {
        self.flags
    }

    /// Permissions of a member, joined or invited.
    pub fn member(&self, user: &str) -> Option<Permissions> {
        self.members.get(user).copied()
    }

    /// True if `user` is a joined member.
    pub fn is_joined(&self, user: &str) -> bool {
        self.member(user).is_some_and(Permissions::is_joined)
    }

    /// Joined members, sorted.
    pub fn joined_members(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|(_, perms)| perms.is_joined())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Stored file by id.
    pub fn file(&self, id: u32) -> Option<&GroupFile> {
        self.files.get(&id)
    }

    /// Stored files in id order.
    pub fn files(&self) -> impl Iterator<Item = &GroupFile> {
        self.files.values()
    }

    fn joined_except(&self, user: &str) -> Vec<String> {
        self.joined_members().into_iter().filter(|name| name != user).collect()
    }

    /// No joined member is left; unanswered invites do not hold a group.
    fn is_abandoned(&self) -> bool {
        !self.flags.contains(GroupFlags::PERSISTENT)
            && !self.members.values().any(|perms| perms.is_joined())
    }
}

/// The user performing an operation.
#[derive(Debug, Clone, Copy)]
pub struct Actor<'a> {
    /// User name
    pub name: &'a str,
    /// Admin users bypass permission checks
    pub admin: bool,
}

impl<'a> Actor<'a> {
    /// Non-admin actor.
    pub fn user(name: &'a str) -> Self {
        Self { name, admin: false }
    }
}

/// Operation that failed a membership or permission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOp {
    /// `!leavegroup`
    Leave,
    /// `!invitegroup`
    Invite,
    /// `!kickgroup`
    Kick,
    /// `@@group`
    Talk,
    /// `!putfile`
    PutFile,
    /// `!getfile` / `!filelist`
    GetFile,
    /// `!removefile`
    RemoveFile,
}

/// Errors from group operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    /// Group name violates the naming rule
    #[error("invalid group name: {0:?}")]
    InvalidName(String),

    /// Group name is taken
    #[error("group already exists: {0}")]
    GroupExists(String),

    /// No such group
    #[error("group not found: {0}")]
    GroupNotFound(String),

    /// Caller has no joined membership
    #[error("not a member of {group} ({op:?})")]
    NotMember {
        /// Group
        group: String,
        /// Attempted operation
        op: GroupOp,
    },

    /// Caller's membership lacks the required bit
    #[error("permission denied in {group} ({op:?})")]
    PermissionDenied {
        /// Group
        group: String,
        /// Attempted operation
        op: GroupOp,
    },

    /// Group does not admit uninvited users
    #[error("group is invite-only: {0}")]
    InviteOnly(String),

    /// Target is already a joined member
    #[error("{user} is already a member of {group}")]
    AlreadyMember {
        /// Group
        group: String,
        /// Target
        user: String,
    },

    /// No invitee of a new group was online
    #[error("no reachable invitee for {0}")]
    NoReachableInvitee(String),

    /// Operation targets the caller
    #[error("operation targets the caller")]
    SelfTarget,

    /// No such user online
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// No such group file
    #[error("file {id} not found in {group}")]
    FileNotFound {
        /// Group
        group: String,
        /// File id
        id: u32,
    },

    /// Group does not allow file transfers
    #[error("transfers disabled in {0}")]
    TransfersDisabled(String),

    /// The lobby cannot be left, kicked from or deleted
    #[error("the lobby is permanent")]
    LobbyIsPermanent,
}

impl GroupError {
    /// Error code reported to the client.
    ///
    /// A missing membership surfaces as `PermissionDenied` except when
    /// leaving.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidName(_) => ErrorCode::InvalidName,
            Self::GroupExists(_) => ErrorCode::GroupExists,
            Self::GroupNotFound(_) => ErrorCode::GroupNotFound,
            Self::NotMember { op: GroupOp::Leave, .. } => ErrorCode::NotMember,
            Self::NotMember { .. } | Self::PermissionDenied { .. } | Self::LobbyIsPermanent => {
                ErrorCode::PermissionDenied
            },
            Self::InviteOnly(_) => ErrorCode::InviteOnly,
            Self::AlreadyMember { .. } => ErrorCode::AlreadyMember,
            Self::NoReachableInvitee(_) => ErrorCode::NoReachableInvitee,
            Self::SelfTarget => ErrorCode::SelfTarget,
            Self::UserNotFound(_) => ErrorCode::UserNotFound,
            Self::FileNotFound { .. } => ErrorCode::FileNotFound,
            Self::TransfersDisabled(_) => ErrorCode::TransfersDisabled,
        }
    }

    /// Error notice for the requester.
    pub fn notice(&self) -> Notice {
        match self {
            Self::InvalidName(name)
            | Self::GroupExists(name)
            | Self::GroupNotFound(name)
            | Self::InviteOnly(name)
            | Self::NoReachableInvitee(name)
            | Self::UserNotFound(name)
            | Self::TransfersDisabled(name) => Notice::error_with(self.code(), name.clone()),
            Self::NotMember { group, .. } | Self::PermissionDenied { group, .. } => {
                Notice::error_with(self.code(), group.clone())
            },
            Self::AlreadyMember { user, .. } => Notice::error_with(self.code(), user.clone()),
            Self::FileNotFound { id, .. } => Notice::error_with(self.code(), id.to_string()),
            Self::SelfTarget | Self::LobbyIsPermanent => Notice::error(self.code()),
        }
    }
}

/// Actions returned by the group manager for the driver to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupAction {
    /// Send a notice to these users
    Notify {
        /// Recipient user names
        recipients: Vec<String>,
        /// Notice to send
        notice: Notice,
    },
    /// `user` became a joined member of `group`
    Joined {
        /// Group
        group: String,
        /// Member
        user: String,
    },
    /// `user` is no longer a joined member of `group`
    Left {
        /// Group
        group: String,
        /// Former member
        user: String,
    },
    /// The group is gone; its storage must be removed
    Deleted {
        /// Group
        group: String,
        /// Joined members at deletion time
        members: Vec<String>,
    },
    /// A stored file must be removed
    DiscardFile {
        /// Group
        group: String,
        /// Stored name
        filename: String,
    },
}

fn notify(recipients: Vec<String>, notice: Notice) -> GroupAction {
    GroupAction::Notify { recipients, notice }
}

fn notify_one(recipient: &str, notice: Notice) -> GroupAction {
    notify(vec![recipient.to_string()], notice)
}

/// Manages groups and memberships.
#[derive(Debug)]
pub struct GroupManager {
    groups: BTreeMap<String, Group>,
}

impl Default for GroupManager {
    fn default() -> Self {
        Self::new()
    }
}

impl GroupManager {
    /// Create a manager holding only the lobby.
    pub fn new() -> Self {
        let mut groups = BTreeMap::new();
        groups.insert(
            LOBBY.to_string(),
            Group::new(LOBBY, GroupFlags::PERSISTENT.with(GroupFlags::TRANSFER_ALLOWED)),
        );
        Self { groups }
    }

    /// Group by name.
    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// True if the group exists.
    pub fn exists(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// Number of groups (lobby included).
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// True if no group exists. Never the case while the lobby is alive.
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn get(&self, name: &str) -> Result<&Group, GroupError> {
        self.groups.get(name).ok_or_else(|| GroupError::GroupNotFound(name.to_string()))
    }

    fn get_mut(&mut self, name: &str) -> Result<&mut Group, GroupError> {
        self.groups.get_mut(name).ok_or_else(|| GroupError::GroupNotFound(name.to_string()))
    }

    fn check(
        group: &Group,
        actor: Actor<'_>,
        needed: Permissions,
        op: GroupOp,
    ) -> Result<(), GroupError> {
        if actor.admin {
            return Ok(());
        }
        let Some(perms) = group.member(actor.name).filter(|perms| perms.is_joined()) else {
            return Err(GroupError::NotMember { group: group.name.clone(), op });
        };
        if !perms.contains(needed) {
            return Err(GroupError::PermissionDenied { group: group.name.clone(), op });
        }
        Ok(())
    }

    /// Create an open, transfer-allowed group with `founder` as its only
    /// joined member and invite `invitees`.
    ///
    /// Unreachable invitees are reported to the founder individually. If none
    /// is reachable the group is removed again.
    ///
    /// # Errors
    ///
    /// - `GroupError::InvalidName` / `GroupExists` if the name is unusable
    /// - `GroupError::NoReachableInvitee` if no invitee is online
    pub fn create(
        &mut self,
        founder: &str,
        name: &str,
        invitees: &[String],
        is_online: impl Fn(&str) -> bool,
    ) -> Result<Vec<GroupAction>, GroupError> {
        self.create_with_flags(founder, name, invitees, GroupFlags::TRANSFER_ALLOWED, is_online)
    }

    /// [`Self::create`] with explicit group flags.
    ///
    /// # Errors
    ///
    /// As [`Self::create`].
    pub fn create_with_flags(
        &mut self,
        founder: &str,
        name: &str,
        invitees: &[String],
        flags: GroupFlags,
        is_online: impl Fn(&str) -> bool,
    ) -> Result<Vec<GroupAction>, GroupError> {
        if !is_valid_name(name) {
            return Err(GroupError::InvalidName(name.to_string()));
        }
        if self.groups.contains_key(name) {
            return Err(GroupError::GroupExists(name.to_string()));
        }

        let mut group = Group::new(name, flags);
        group.members.insert(founder.to_string(), Permissions::ALL);

        let mut actions = Vec::new();
        let mut invited = Vec::new();
        for invitee in invitees {
            if group.members.contains_key(invitee) {
                if invitee == founder {
                    actions.push(notify_one(founder, Notice::error(ErrorCode::SelfTarget)));
                }
                continue;
            }
            if !is_online(invitee) {
                actions.push(notify_one(
                    founder,
                    Notice::error_with(ErrorCode::UserNotFound, invitee.clone()),
                ));
                continue;
            }
            group.members.insert(invitee.clone(), Permissions::NONE);
            invited.push(invitee.clone());
        }

        if invited.is_empty() {
            return Err(GroupError::NoReachableInvitee(name.to_string()));
        }

        self.groups.insert(name.to_string(), group);

        actions.push(GroupAction::Joined { group: name.to_string(), user: founder.to_string() });
        actions.push(notify_one(founder, Notice::JoinedGroup { group: name.to_string() }));
        actions.push(notify(invited, Notice::GroupInvite {
            group: name.to_string(),
            sender: founder.to_string(),
        }));
        Ok(actions)
    }

    /// Join a group, upgrading an invitation in place.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    /// - `GroupError::AlreadyMember` if already joined
    /// - `GroupError::InviteOnly` if uninvited and the group is invite-only
    pub fn join(&mut self, user: &str, name: &str) -> Result<Vec<GroupAction>, GroupError> {
        let group = self.get_mut(name)?;

        match group.member(user) {
            Some(perms) if perms.is_joined() => {
                return Err(GroupError::AlreadyMember {
                    group: name.to_string(),
                    user: user.to_string(),
                });
            },
            Some(_) => {},
            None if group.flags.contains(GroupFlags::INVITE_ONLY) => {
                return Err(GroupError::InviteOnly(name.to_string()));
            },
            None => {},
        }
        group.members.insert(user.to_string(), Permissions::OPEN_JOIN);

        let others = group.joined_except(user);
        let mut actions = vec![
            GroupAction::Joined { group: name.to_string(), user: user.to_string() },
            notify_one(user, Notice::JoinedGroup { group: name.to_string() }),
        ];
        if !others.is_empty() {
            actions.push(notify(others, Notice::GroupJoined {
                group: name.to_string(),
                user: user.to_string(),
            }));
        }
        Ok(actions)
    }

    /// Leave a group or decline an invitation.
    ///
    /// Declining is silent. Leaving notifies the remaining members and the
    /// leaver; the group is deleted once no joined member remains, dropping
    /// any unanswered invites with it.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    /// - `GroupError::LobbyIsPermanent` for the lobby
    /// - `GroupError::NotMember` if there is no membership
    pub fn leave(&mut self, user: &str, name: &str) -> Result<Vec<GroupAction>, GroupError> {
        if name == LOBBY {
            return Err(GroupError::LobbyIsPermanent);
        }
        let group = self.get_mut(name)?;
        let Some(perms) = group.members.remove(user) else {
            return Err(GroupError::NotMember { group: name.to_string(), op: GroupOp::Leave });
        };

        let mut actions = Vec::new();
        if perms.is_joined() {
            let mut recipients = group.joined_members();
            recipients.push(user.to_string());
            actions.push(GroupAction::Left { group: name.to_string(), user: user.to_string() });
            actions.push(notify(recipients, Notice::LeftGroup {
                group: name.to_string(),
                user: user.to_string(),
            }));
        }

        actions.extend(self.delete_if_abandoned(name));
        Ok(actions)
    }

    /// Invite users into a group.
    ///
    /// Per-target failures go to the inviter; the operation itself succeeds.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    /// - `GroupError::NotMember` / `PermissionDenied` without `INVITE`
    pub fn invite(
        &mut self,
        actor: Actor<'_>,
        name: &str,
        targets: &[String],
        is_online: impl Fn(&str) -> bool,
    ) -> Result<Vec<GroupAction>, GroupError> {
        let group = self.get_mut(name)?;
        Self::check(group, actor, Permissions::INVITE, GroupOp::Invite)?;

        let mut actions = Vec::new();
        for target in targets {
            let failure = if target == actor.name {
                Some(GroupError::SelfTarget)
            } else if !is_online(target) {
                Some(GroupError::UserNotFound(target.clone()))
            } else if group.is_joined(target) {
                Some(GroupError::AlreadyMember { group: name.to_string(), user: target.clone() })
            } else {
                None
            };
            if let Some(err) = failure {
                actions.push(notify_one(actor.name, err.notice()));
                continue;
            }

            group.members.insert(target.clone(), Permissions::NONE);
            actions.push(notify_one(target, Notice::GroupInvite {
                group: name.to_string(),
                sender: actor.name.to_string(),
            }));
            actions.push(notify(group.joined_members(), Notice::GroupInvited {
                group: name.to_string(),
                user: target.clone(),
                by: actor.name.to_string(),
            }));
        }
        Ok(actions)
    }

    /// Remove members from a group.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    /// - `GroupError::LobbyIsPermanent` for the lobby
    /// - `GroupError::NotMember` / `PermissionDenied` without `KICK`
    pub fn kick(
        &mut self,
        actor: Actor<'_>,
        name: &str,
        targets: &[String],
    ) -> Result<Vec<GroupAction>, GroupError> {
        if name == LOBBY {
            return Err(GroupError::LobbyIsPermanent);
        }
        let group = self.get_mut(name)?;
        Self::check(group, actor, Permissions::KICK, GroupOp::Kick)?;

        let mut actions = Vec::new();
        for target in targets {
            if target == actor.name {
                actions.push(notify_one(actor.name, GroupError::SelfTarget.notice()));
                continue;
            }
            let Some(perms) = group.members.remove(target) else {
                actions.push(notify_one(
                    actor.name,
                    Notice::error_with(ErrorCode::NotMember, target.clone()),
                ));
                continue;
            };

            if perms.is_joined() {
                actions.push(GroupAction::Left { group: name.to_string(), user: target.clone() });
            }
            let mut recipients = group.joined_members();
            recipients.push(target.clone());
            actions.push(notify(recipients, Notice::GroupKicked {
                group: name.to_string(),
                user: target.clone(),
                by: actor.name.to_string(),
            }));
        }

        actions.extend(self.delete_if_abandoned(name));
        Ok(actions)
    }

    /// Recipients of a group message from `actor`: joined members except the
    /// sender.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    /// - `GroupError::NotMember` / `PermissionDenied` without `TALK`
    pub fn talk_recipients(
        &self,
        actor: Actor<'_>,
        name: &str,
    ) -> Result<Vec<String>, GroupError> {
        let group = self.get(name)?;
        Self::check(group, actor, Permissions::TALK, GroupOp::Talk)?;
        Ok(group.joined_except(actor.name))
    }

    /// Joined members of a group.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    pub fn members(&self, name: &str) -> Result<Vec<String>, GroupError> {
        Ok(self.get(name)?.joined_members())
    }

    /// Check that `actor` may upload into `name`.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    /// - `GroupError::TransfersDisabled` if the group forbids transfers
    /// - `GroupError::NotMember` / `PermissionDenied` without `PUT_FILE`
    pub fn authorize_put(&self, actor: Actor<'_>, name: &str) -> Result<(), GroupError> {
        let group = self.get(name)?;
        if !group.flags.contains(GroupFlags::TRANSFER_ALLOWED) {
            return Err(GroupError::TransfersDisabled(name.to_string()));
        }
        Self::check(group, actor, Permissions::PUT_FILE, GroupOp::PutFile)
    }

    /// Check that `actor` may download file `id` from `name`.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    /// - `GroupError::TransfersDisabled` if the group forbids transfers
    /// - `GroupError::NotMember` / `PermissionDenied` without `GET_FILE`
    /// - `GroupError::FileNotFound` if there is no such file
    pub fn authorize_get(
        &self,
        actor: Actor<'_>,
        name: &str,
        id: u32,
    ) -> Result<GroupFile, GroupError> {
        let group = self.get(name)?;
        if !group.flags.contains(GroupFlags::TRANSFER_ALLOWED) {
            return Err(GroupError::TransfersDisabled(name.to_string()));
        }
        Self::check(group, actor, Permissions::GET_FILE, GroupOp::GetFile)?;
        group
            .file(id)
            .cloned()
            .ok_or_else(|| GroupError::FileNotFound { group: name.to_string(), id })
    }

    /// Register a verified upload and announce it to the group.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group was deleted meanwhile
    pub fn add_file(
        &mut self,
        name: &str,
        uploader: &str,
        filename: &str,
        size: u64,
        crc: u32,
    ) -> Result<Vec<GroupAction>, GroupError> {
        let group = self.get_mut(name)?;
        let id = group.next_file_id;
        group.next_file_id += 1;
        group.files.insert(id, GroupFile {
            id,
            uploader: uploader.to_string(),
            filename: filename.to_string(),
            size,
            crc,
        });

        Ok(vec![notify(group.joined_members(), Notice::NewFile {
            group: name.to_string(),
            id,
            filename: filename.to_string(),
            size,
            uploader: uploader.to_string(),
        })])
    }

    /// File listing of a group.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    /// - `GroupError::NotMember` / `PermissionDenied` without `GET_FILE`
    pub fn file_list(&self, actor: Actor<'_>, name: &str) -> Result<Notice, GroupError> {
        let group = self.get(name)?;
        Self::check(group, actor, Permissions::GET_FILE, GroupOp::GetFile)?;

        let files = group
            .files()
            .map(|file| FileListing {
                id: file.id,
                filename: file.filename.clone(),
                size: file.size,
                uploader: file.uploader.clone(),
            })
            .collect();
        Ok(Notice::FileList { group: name.to_string(), files })
    }

    /// Remove a stored file. The uploader or a member with `KICK` may do so.
    ///
    /// # Errors
    ///
    /// - `GroupError::GroupNotFound` if the group does not exist
    /// - `GroupError::FileNotFound` if there is no such file
    /// - `GroupError::NotMember` / `PermissionDenied` otherwise
    pub fn remove_file(
        &mut self,
        actor: Actor<'_>,
        name: &str,
        id: u32,
    ) -> Result<Vec<GroupAction>, GroupError> {
        let group = self.get_mut(name)?;
        let file = group
            .file(id)
            .ok_or_else(|| GroupError::FileNotFound { group: name.to_string(), id })?;

        if file.uploader != actor.name {
            Self::check(group, actor, Permissions::KICK, GroupOp::RemoveFile)?;
        }

        let Some(file) = group.files.remove(&id) else {
            return Err(GroupError::FileNotFound { group: name.to_string(), id });
        };
        Ok(vec![
            notify(group.joined_members(), Notice::FileRemoved { group: name.to_string(), id }),
            GroupAction::DiscardFile { group: name.to_string(), filename: file.filename },
        ])
    }

    /// Delete a group (admin console).
    ///
    /// # Errors
    ///
    /// - `GroupError::LobbyIsPermanent` for the lobby
    /// - `GroupError::GroupNotFound` if the group does not exist
    pub fn delete_group(&mut self, name: &str) -> Result<Vec<GroupAction>, GroupError> {
        if name == LOBBY {
            return Err(GroupError::LobbyIsPermanent);
        }
        let group =
            self.groups.remove(name).ok_or_else(|| GroupError::GroupNotFound(name.to_string()))?;

        let members = group.joined_members();
        Ok(vec![
            notify(members.clone(), Notice::GroupDeleted { group: name.to_string() }),
            GroupAction::Deleted { group: name.to_string(), members },
        ])
    }

    /// Drop every membership of a disconnecting user.
    ///
    /// Remaining members are told the user left; the user is not.
    pub fn remove_user(&mut self, user: &str) -> Vec<GroupAction> {
        let names: Vec<String> = self
            .groups
            .iter()
            .filter(|(_, group)| group.members.contains_key(user))
            .map(|(name, _)| name.clone())
            .collect();

        let mut actions = Vec::new();
        for name in names {
            let Some(group) = self.groups.get_mut(&name) else {
                continue;
            };
            let Some(perms) = group.members.remove(user) else {
                continue;
            };

            if perms.is_joined() {
                let remaining = group.joined_members();
                if !remaining.is_empty() {
                    actions.push(notify(remaining, Notice::LeftGroup {
                        group: name.clone(),
                        user: user.to_string(),
                    }));
                }
            }
            actions.extend(self.delete_if_abandoned(&name));
        }
        actions
    }

    fn delete_if_abandoned(&mut self, name: &str) -> Option<GroupAction> {
        if !self.groups.get(name)?.is_abandoned() {
            return None;
        }
        self.groups.remove(name);
        Some(GroupAction::Deleted { group: name.to_string(), members: Vec::new() })
    }
}
