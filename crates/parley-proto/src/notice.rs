//! Server → client messages.
//!
//! Notices render to the same `!name=args` text convention the client uses.
//! The server never parses its own notices, so rendering is one-way.

use std::fmt;

use bytes::Bytes;

use crate::command::FileOffer;

/// Short error codes carried by `!err=<code>[,<detail>]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Frame markers or long-message header were invalid
    BadFrame,
    /// Command text could not be parsed
    BadCommand,
    /// Command requires a registered session
    NotRegistered,
    /// Connection already carries a session
    AlreadyRegistered,
    /// User or group name violates the naming rule
    InvalidName,
    /// No collision suffix fits the name budget
    NameExhausted,
    /// No such user is online
    UserNotFound,
    /// No such group
    GroupNotFound,
    /// Group name is already taken
    GroupExists,
    /// Caller is not a member of the group
    NotMember,
    /// Caller lacks the required permission bit
    PermissionDenied,
    /// Group only admits invited users
    InviteOnly,
    /// Target is already a joined member
    AlreadyMember,
    /// None of the invitees of a new group could be reached
    NoReachableInvitee,
    /// A transfer is already attached to the session
    TransferBusy,
    /// No matching transfer exists
    NoTransfer,
    /// Channel registration did not match the stored transfer
    TokenMismatch,
    /// Uploaded bytes do not match the declared checksum
    ChecksumMismatch,
    /// No such group file
    FileNotFound,
    /// Group does not allow file transfers
    TransfersDisabled,
    /// Command targets the caller itself
    SelfTarget,
    /// Operation is declared but its policy is not defined
    Unsupported,
    /// Server-side storage failed
    Storage,
}

impl ErrorCode {
    /// Wire spelling of the code.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadFrame => "BadFrame",
            Self::BadCommand => "BadCommand",
            Self::NotRegistered => "NotRegistered",
            Self::AlreadyRegistered => "AlreadyRegistered",
            Self::InvalidName => "InvalidName",
            Self::NameExhausted => "NameExhausted",
            Self::UserNotFound => "UserNotFound",
            Self::GroupNotFound => "GroupNotFound",
            Self::GroupExists => "GroupExists",
            Self::NotMember => "NotMember",
            Self::PermissionDenied => "PermissionDenied",
            Self::InviteOnly => "InviteOnly",
            Self::AlreadyMember => "AlreadyMember",
            Self::NoReachableInvitee => "NoReachableInvitee",
            Self::TransferBusy => "TransferBusy",
            Self::NoTransfer => "NoTransfer",
            Self::TokenMismatch => "TokenMismatch",
            Self::ChecksumMismatch => "ChecksumMismatch",
            Self::FileNotFound => "FileNotFound",
            Self::TransfersDisabled => "TransfersDisabled",
            Self::SelfTarget => "SelfTarget",
            Self::Unsupported => "Unsupported",
            Self::Storage => "Storage",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a group file listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileListing {
    /// Group file id
    pub id: u32,
    /// Stored file name
    pub filename: String,
    /// Size in bytes
    pub size: u64,
    /// Uploading user
    pub uploader: String,
}

/// A message pushed from server to client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Registration succeeded under `username`
    RegReply {
        /// Final (possibly suffixed) name
        username: String,
    },
    /// Online users, optionally restricted to one group
    UserList {
        /// Group the list belongs to
        group: Option<String>,
        /// User names
        users: Vec<String>,
    },
    /// A user came online
    UserOnline {
        /// User name
        user: String,
    },
    /// A user went offline
    UserOffline {
        /// User name
        user: String,
    },
    /// Direct chat message
    PrivateMessage {
        /// Sender
        from: String,
        /// Body
        text: String,
    },
    /// Group chat message
    GroupMessage {
        /// Group
        group: String,
        /// Sender
        from: String,
        /// Body
        text: String,
    },
    /// Global chat message
    PublicMessage {
        /// Sender
        from: String,
        /// Body
        text: String,
    },
    /// Broadcast from the server console
    AdminMessage {
        /// Body
        text: String,
    },
    /// Invitation delivered to the invitee
    GroupInvite {
        /// Group
        group: String,
        /// Inviting user
        sender: String,
    },
    /// Invitation announced to the group
    GroupInvited {
        /// Group
        group: String,
        /// Invitee
        user: String,
        /// Inviting user
        by: String,
    },
    /// Confirmation sent to the joining user
    JoinedGroup {
        /// Group
        group: String,
    },
    /// A member joined
    GroupJoined {
        /// Group
        group: String,
        /// New member
        user: String,
    },
    /// A member left
    LeftGroup {
        /// Group
        group: String,
        /// Departing member
        user: String,
    },
    /// A member was kicked
    GroupKicked {
        /// Group
        group: String,
        /// Removed member
        user: String,
        /// Kicking user
        by: String,
    },
    /// The group was deleted by the server operator
    GroupDeleted {
        /// Group
        group: String,
    },
    /// A file was added to the group
    NewFile {
        /// Group
        group: String,
        /// Group file id
        id: u32,
        /// Stored name
        filename: String,
        /// Size in bytes
        size: u64,
        /// Uploading user
        uploader: String,
    },
    /// Files of a group
    FileList {
        /// Group
        group: String,
        /// Entries in id order
        files: Vec<FileListing>,
    },
    /// A file was removed from the group
    FileRemoved {
        /// Group
        group: String,
        /// Group file id
        id: u32,
    },
    /// Transfer offer forwarded to the target
    SendFile {
        /// Offered file
        offer: FileOffer,
        /// Offering user
        sender: String,
        /// Capability token
        token: String,
    },
    /// Token issued to the offering user
    SendFileOk {
        /// Offered file name
        filename: String,
        /// Target user
        target: String,
        /// Capability token
        token: String,
    },
    /// Acceptance forwarded to the offering user
    AcceptFile {
        /// Accepted file
        offer: FileOffer,
        /// Accepting user
        receiver: String,
        /// Capability token
        token: String,
    },
    /// Rejection forwarded to the offering user
    RejectFile {
        /// Rejecting user
        user: String,
        /// Reason
        reason: String,
    },
    /// Cancellation or expiry of a transfer
    CancelFile {
        /// Counterpart user
        user: String,
        /// Reason
        reason: String,
    },
    /// Upload approved; open a channel with this token
    PutFileOk {
        /// Destination group
        group: String,
        /// File name
        filename: String,
        /// Capability token
        token: String,
    },
    /// Download approved; open a channel with this token
    GetFileOk {
        /// Source group
        group: String,
        /// Group file id
        id: u32,
        /// Stored file
        offer: FileOffer,
        /// Capability token
        token: String,
    },
    /// The session was granted the admin flag
    Promoted,
    /// The session lost the admin flag
    Demoted,
    /// Error reply
    Error {
        /// Error code
        code: ErrorCode,
        /// Optional detail (offending name, reason)
        detail: Option<String>,
    },
}

impl Notice {
    /// Error reply without detail.
    #[must_use]
    pub fn error(code: ErrorCode) -> Self {
        Self::Error { code, detail: None }
    }

    /// Error reply with detail.
    pub fn error_with(code: ErrorCode, detail: impl Into<String>) -> Self {
        Self::Error { code, detail: Some(detail.into()) }
    }

    /// Rendered payload bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegReply { username } => write!(f, "!regreply:username={username}"),
            Self::UserList { group: None, users } => write!(f, "!userlist={}", users.join(",")),
            Self::UserList { group: Some(group), users } => {
                write!(f, "!userlist={group}:{}", users.join(","))
            },
            Self::UserOnline { user } => write!(f, "!useronline={user}"),
            Self::UserOffline { user } => write!(f, "!useroffline={user}"),
            Self::PrivateMessage { from, text } => write!(f, "!privmsg={from} {text}"),
            Self::GroupMessage { group, from, text } => write!(f, "!groupmsg={group},{from} {text}"),
            Self::PublicMessage { from, text } => write!(f, "!pubmsg={from} {text}"),
            Self::AdminMessage { text } => write!(f, "!adminmsg={text}"),
            Self::GroupInvite { group, sender } => write!(f, "!groupinvite={group},sender={sender}"),
            Self::GroupInvited { group, user, by } => {
                write!(f, "!groupinvited={group},user={user},by={by}")
            },
            Self::JoinedGroup { group } => write!(f, "!joinedgroup={group}"),
            Self::GroupJoined { group, user } => write!(f, "!groupjoined={group},user={user}"),
            Self::LeftGroup { group, user } => write!(f, "!leftgroup={group},user={user}"),
            Self::GroupKicked { group, user, by } => {
                write!(f, "!groupkicked={group},user={user},by={by}")
            },
            Self::GroupDeleted { group } => write!(f, "!groupdeleted={group}"),
            Self::NewFile { group, id, filename, size, uploader } => write!(
                f,
                "!newfile={group},id={id},file={filename},size={size},uploader={uploader}"
            ),
            Self::FileList { group, files } => {
                write!(f, "!filelist={group} ")?;
                for (idx, file) in files.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(";")?;
                    }
                    write!(f, "{}:{}:{}:{}", file.id, file.filename, file.size, file.uploader)?;
                }
                Ok(())
            },
            Self::FileRemoved { group, id } => write!(f, "!fileremoved={group},id={id}"),
            Self::SendFile { offer, sender, token } => write!(
                f,
                "!sendfile={},size={},crc={:#x},sender={sender},token={token}",
                offer.filename, offer.size, offer.crc
            ),
            Self::SendFileOk { filename, target, token } => {
                write!(f, "!sendfileok={filename},target={target},token={token}")
            },
            Self::AcceptFile { offer, receiver, token } => write!(
                f,
                "!acceptfile={},size={},crc={:#x},receiver={receiver},token={token}",
                offer.filename, offer.size, offer.crc
            ),
            Self::RejectFile { user, reason } => write!(f, "!rejectfile={user},reason={reason}"),
            Self::CancelFile { user, reason } => write!(f, "!cancelfile={user},reason={reason}"),
            Self::PutFileOk { group, filename, token } => {
                write!(f, "!putfileok={group},file={filename},token={token}")
            },
            Self::GetFileOk { group, id, offer, token } => write!(
                f,
                "!getfileok={group},id={id},file={},size={},crc={:#x},token={token}",
                offer.filename, offer.size, offer.crc
            ),
            Self::Promoted => f.write_str("!promoted"),
            Self::Demoted => f.write_str("!demoted"),
            Self::Error { code, detail: None } => write!(f, "!err={code}"),
            Self::Error { code, detail: Some(detail) } => write!(f, "!err={code},{detail}"),
        }
    }
}
