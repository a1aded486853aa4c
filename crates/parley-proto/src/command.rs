//! Client → server commands.
//!
//! Commands are text payloads inside a frame. `!name=args` are control
//! commands with comma-separated sub-fields; `@user text` and `@@group text`
//! address chat; anything else is a global chat line.

use crate::errors::{ProtocolError, Result};

/// Declared properties of a file being moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    /// File name as announced by the client
    pub filename: String,
    /// Declared size in bytes
    pub size: u64,
    /// Declared CRC-32 of the content
    pub crc: u32,
}

/// Transfer-channel registration sent as the first message on a secondary
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelClaim {
    /// File being moved
    pub offer: FileOffer,
    /// Sending user, or group name for downloads
    pub sender: String,
    /// Receiving user, or group name for uploads
    pub receiver: String,
    /// Capability token issued during negotiation
    pub token: String,
}

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `!register:username=<name>`
    Register {
        /// Requested name (before collision handling)
        username: String,
    },
    /// `@name text`
    DirectMessage {
        /// Recipient
        to: String,
        /// Message body
        text: String,
    },
    /// `@@group text`
    GroupMessage {
        /// Target group
        group: String,
        /// Message body
        text: String,
    },
    /// Any line without a prefix
    Broadcast {
        /// Message body
        text: String,
    },
    /// `!newgroup=<name>[,<invitee>,...][,mode=open|invite]`
    NewGroup {
        /// Group name
        name: String,
        /// Users to pre-invite
        invitees: Vec<String>,
        /// Only invited users may join
        invite_only: bool,
    },
    /// `!joingroup=<name>`
    JoinGroup {
        /// Group name
        name: String,
    },
    /// `!leavegroup=<name>`
    LeaveGroup {
        /// Group name
        name: String,
    },
    /// `!invitegroup=<name>,<user>,...`
    InviteGroup {
        /// Group name
        name: String,
        /// Users to invite
        users: Vec<String>,
    },
    /// `!kickgroup=<name>,<user>,...`
    KickGroup {
        /// Group name
        name: String,
        /// Users to remove
        users: Vec<String>,
    },
    /// `!userlist[,group=<name>]`
    UserList {
        /// Restrict to members of this group
        group: Option<String>,
    },
    /// `!sendfile=<name>,size=<n>,crc=<hex>[,target=<user>]`
    SendFile {
        /// File being offered
        offer: FileOffer,
        /// Receiving user
        target: Option<String>,
    },
    /// `!acceptfile=<name>,size=<n>,crc=<hex>,sender=<user>,token=<tok>`
    AcceptFile {
        /// File being accepted
        offer: FileOffer,
        /// User who offered it
        sender: String,
        /// Token from the offer
        token: String,
    },
    /// `!rejectfile=<user>,reason=<text>`
    RejectFile {
        /// User whose offer is rejected
        user: String,
        /// Free-form reason
        reason: String,
    },
    /// `!cancelfile=<user>,reason=<text>`
    CancelFile {
        /// Transfer counterpart
        user: String,
        /// Free-form reason
        reason: String,
    },
    /// `!xfersend=...` on a secondary connection
    TransferSend(ChannelClaim),
    /// `!xferrecv=...` on a secondary connection
    TransferReceive(ChannelClaim),
    /// `!putfile=<group>,file=<name>,size=<n>,crc=<hex>`
    PutFile {
        /// Destination group
        group: String,
        /// File being uploaded
        offer: FileOffer,
    },
    /// `!getfile=<group> <fileid>`
    GetFile {
        /// Source group
        group: String,
        /// Group file id
        file_id: u32,
    },
    /// `!filelist=<group>`
    FileList {
        /// Group to list
        group: String,
    },
    /// `!removefile=<group>,<fileid>`
    RemoveFile {
        /// Group holding the file
        group: String,
        /// Group file id
        file_id: u32,
    },
    /// `!bangroup=...`
    BanGroup {
        /// Raw arguments
        args: String,
    },
    /// `!setperm=...`
    SetPermission {
        /// Raw arguments
        args: String,
    },
    /// `!close`
    Close,
}

impl Command {
    /// Parse a command payload.
    ///
    /// # Errors
    ///
    /// - `ProtocolError::InvalidUtf8` if the payload is not UTF-8
    /// - `ProtocolError::UnknownCommand` for an unrecognised `!name`
    /// - `ProtocolError::MalformedCommand` for bad arguments
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::InvalidUtf8)?;
        let text = text.trim_end_matches(['\r', '\n']);

        if let Some(rest) = text.strip_prefix("@@") {
            let (group, text) = split_addressed(rest, "group message")?;
            return Ok(Self::GroupMessage { group, text });
        }
        if let Some(rest) = text.strip_prefix('@') {
            let (to, text) = split_addressed(rest, "direct message")?;
            return Ok(Self::DirectMessage { to, text });
        }
        let Some(control) = text.strip_prefix('!') else {
            return Ok(Self::Broadcast { text: text.to_string() });
        };

        if let Some(rest) = control.strip_prefix("register:") {
            let username = rest
                .strip_prefix("username=")
                .ok_or_else(|| ProtocolError::malformed("register", "expected username=<name>"))?;
            return Ok(Self::Register { username: username.to_string() });
        }

        let (name, args) = match control.find(['=', ',']) {
            Some(idx) if control.as_bytes()[idx] == b'=' => (&control[..idx], &control[idx + 1..]),
            Some(idx) => (&control[..idx], &control[idx..]),
            None => (control, ""),
        };

        match name {
            "close" => Ok(Self::Close),
            "userlist" => parse_userlist(args),
            "newgroup" => parse_newgroup(args),
            "joingroup" => Ok(Self::JoinGroup { name: single("joingroup", args)? }),
            "leavegroup" => Ok(Self::LeaveGroup { name: single("leavegroup", args)? }),
            "invitegroup" => {
                let (name, users) = name_and_users("invitegroup", args)?;
                Ok(Self::InviteGroup { name, users })
            },
            "kickgroup" => {
                let (name, users) = name_and_users("kickgroup", args)?;
                Ok(Self::KickGroup { name, users })
            },
            "sendfile" => {
                let fields = Fields::parse("sendfile", args)?;
                let offer = fields.offer_with_positional_name()?;
                let target = fields.optional("target").map(str::to_string);
                Ok(Self::SendFile { offer, target })
            },
            "acceptfile" => {
                let fields = Fields::parse("acceptfile", args)?;
                Ok(Self::AcceptFile {
                    offer: fields.offer_with_positional_name()?,
                    sender: fields.required("sender")?.to_string(),
                    token: fields.required("token")?.to_string(),
                })
            },
            "rejectfile" => {
                let (user, reason) = user_and_reason("rejectfile", args)?;
                Ok(Self::RejectFile { user, reason })
            },
            "cancelfile" => {
                let (user, reason) = user_and_reason("cancelfile", args)?;
                Ok(Self::CancelFile { user, reason })
            },
            "xfersend" => Ok(Self::TransferSend(parse_claim("xfersend", args)?)),
            "xferrecv" => Ok(Self::TransferReceive(parse_claim("xferrecv", args)?)),
            "putfile" => {
                let fields = Fields::parse("putfile", args)?;
                let group = fields.positional()?.to_string();
                let offer = FileOffer {
                    filename: fields.required("file")?.to_string(),
                    size: fields.size()?,
                    crc: fields.crc()?,
                };
                Ok(Self::PutFile { group, offer })
            },
            "getfile" => {
                let (group, id) = args
                    .split_once(' ')
                    .ok_or_else(|| ProtocolError::malformed("getfile", "expected <group> <fileid>"))?;
                Ok(Self::GetFile { group: nonempty("getfile", group)?, file_id: file_id("getfile", id)? })
            },
            "filelist" => Ok(Self::FileList { group: single("filelist", args)? }),
            "removefile" => {
                let (group, id) = args
                    .split_once(',')
                    .ok_or_else(|| ProtocolError::malformed("removefile", "expected <group>,<fileid>"))?;
                Ok(Self::RemoveFile {
                    group: nonempty("removefile", group)?,
                    file_id: file_id("removefile", id)?,
                })
            },
            "bangroup" => Ok(Self::BanGroup { args: args.to_string() }),
            "setperm" => Ok(Self::SetPermission { args: args.to_string() }),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Parse a hexadecimal CRC with or without a `0x` prefix.
///
/// # Errors
///
/// - `ProtocolError::MalformedCommand` if the value is not 32-bit hex
pub fn parse_crc(value: &str) -> Result<u32> {
    let digits = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")).unwrap_or(value);
    u32::from_str_radix(digits, 16)
        .map_err(|_| ProtocolError::malformed("crc", format!("not a 32-bit hex value: {value}")))
}

fn split_addressed(rest: &str, command: &'static str) -> Result<(String, String)> {
    let (target, text) = rest.split_once(' ').unwrap_or((rest, ""));
    if target.is_empty() {
        return Err(ProtocolError::malformed(command, "missing recipient"));
    }
    Ok((target.to_string(), text.to_string()))
}

fn nonempty(command: &'static str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ProtocolError::malformed(command, "missing argument"));
    }
    Ok(value.to_string())
}

fn single(command: &'static str, args: &str) -> Result<String> {
    if args.contains(',') {
        return Err(ProtocolError::malformed(command, "expected a single name"));
    }
    nonempty(command, args)
}

fn list(command: &'static str, args: &str) -> Result<Vec<String>> {
    let parts: Vec<String> =
        args.split(',').map(str::trim).filter(|p| !p.is_empty()).map(str::to_string).collect();
    if parts.is_empty() {
        return Err(ProtocolError::malformed(command, "missing argument"));
    }
    Ok(parts)
}

fn parse_newgroup(args: &str) -> Result<Command> {
    let mut parts = list("newgroup", args)?;
    let name = parts.remove(0);

    let mut invite_only = false;
    let mut invitees = Vec::with_capacity(parts.len());
    for part in parts {
        match part.strip_prefix("mode=") {
            Some("open") => invite_only = false,
            Some("invite") => invite_only = true,
            Some(_) => {
                return Err(ProtocolError::malformed("newgroup", "mode must be open or invite"));
            },
            None => invitees.push(part),
        }
    }
    Ok(Command::NewGroup { name, invitees, invite_only })
}

fn name_and_users(command: &'static str, args: &str) -> Result<(String, Vec<String>)> {
    let mut parts = list(command, args)?;
    if parts.len() < 2 {
        return Err(ProtocolError::malformed(command, "expected <group>,<user>,..."));
    }
    let name = parts.remove(0);
    Ok((name, parts))
}

fn file_id(command: &'static str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::malformed(command, format!("invalid file id: {value}")))
}

fn user_and_reason(command: &'static str, args: &str) -> Result<(String, String)> {
    let (user, reason) = match args.split_once(",reason=") {
        Some((user, reason)) => (user, reason.to_string()),
        None => (args, String::new()),
    };
    Ok((nonempty(command, user)?, reason))
}

fn parse_userlist(args: &str) -> Result<Command> {
    if args.is_empty() {
        return Ok(Command::UserList { group: None });
    }
    let group = args
        .strip_prefix(",group=")
        .ok_or_else(|| ProtocolError::malformed("userlist", "expected ,group=<name>"))?;
    Ok(Command::UserList { group: Some(nonempty("userlist", group)?) })
}

fn parse_claim(command: &'static str, args: &str) -> Result<ChannelClaim> {
    let fields = Fields::parse(command, args)?;
    Ok(ChannelClaim {
        offer: fields.offer_with_positional_name()?,
        sender: fields.required("sender")?.to_string(),
        receiver: fields.required("receiver")?.to_string(),
        token: fields.required("token")?.to_string(),
    })
}

/// Positional values followed by `key=value` pairs.
struct Fields<'a> {
    command: &'static str,
    positional: Vec<&'a str>,
    keyed: Vec<(&'a str, &'a str)>,
}

impl<'a> Fields<'a> {
    fn parse(command: &'static str, args: &'a str) -> Result<Self> {
        let mut positional = Vec::new();
        let mut keyed = Vec::new();
        for part in args.split(',') {
            match part.split_once('=') {
                Some((key, value)) => keyed.push((key.trim(), value.trim())),
                None if !part.trim().is_empty() => positional.push(part.trim()),
                None => {},
            }
        }
        if positional.is_empty() && keyed.is_empty() {
            return Err(ProtocolError::malformed(command, "missing arguments"));
        }
        Ok(Self { command, positional, keyed })
    }

    fn positional(&self) -> Result<&'a str> {
        self.positional
            .first()
            .copied()
            .ok_or_else(|| ProtocolError::malformed(self.command, "missing leading name"))
    }

    fn optional(&self, key: &str) -> Option<&'a str> {
        self.keyed.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }

    fn required(&self, key: &'static str) -> Result<&'a str> {
        match self.optional(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(ProtocolError::malformed(self.command, format!("missing {key}="))),
        }
    }

    fn size(&self) -> Result<u64> {
        let value = self.required("size")?;
        value
            .parse()
            .map_err(|_| ProtocolError::malformed(self.command, format!("invalid size: {value}")))
    }

    fn crc(&self) -> Result<u32> {
        parse_crc(self.required("crc")?)
    }

    fn offer_with_positional_name(&self) -> Result<FileOffer> {
        Ok(FileOffer { filename: self.positional()?.to_string(), size: self.size()?, crc: self.crc()? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Command> {
        Command::parse(text.as_bytes())
    }

    #[test]
    fn register() {
        assert_eq!(
            parse("!register:username=bob").unwrap(),
            Command::Register { username: "bob".to_string() }
        );
        assert!(parse("!register:bob").is_err());
    }

    #[test]
    fn chat_prefixes() {
        assert_eq!(
            parse("@carol hi there").unwrap(),
            Command::DirectMessage { to: "carol".to_string(), text: "hi there".to_string() }
        );
        assert_eq!(
            parse("@@team status?").unwrap(),
            Command::GroupMessage { group: "team".to_string(), text: "status?".to_string() }
        );
        assert_eq!(parse("hello all").unwrap(), Command::Broadcast { text: "hello all".to_string() });
        assert!(parse("@ nobody").is_err());
    }

    #[test]
    fn group_commands() {
        assert_eq!(
            parse("!newgroup=team,carol,dave").unwrap(),
            Command::NewGroup {
                name: "team".to_string(),
                invitees: vec!["carol".to_string(), "dave".to_string()],
                invite_only: false,
            }
        );
        assert_eq!(
            parse("!newgroup=solo").unwrap(),
            Command::NewGroup { name: "solo".to_string(), invitees: vec![], invite_only: false }
        );
        assert_eq!(
            parse("!newgroup=team,mode=invite,carol").unwrap(),
            Command::NewGroup {
                name: "team".to_string(),
                invitees: vec!["carol".to_string()],
                invite_only: true,
            }
        );
        assert!(parse("!newgroup=team,carol,mode=secret").is_err());
        assert_eq!(parse("!joingroup=team").unwrap(), Command::JoinGroup { name: "team".to_string() });
        assert!(parse("!invitegroup=team").is_err());
        assert_eq!(
            parse("!kickgroup=team,eve").unwrap(),
            Command::KickGroup { name: "team".to_string(), users: vec!["eve".to_string()] }
        );
    }

    #[test]
    fn userlist() {
        assert_eq!(parse("!userlist").unwrap(), Command::UserList { group: None });
        assert_eq!(
            parse("!userlist,group=team").unwrap(),
            Command::UserList { group: Some("team".to_string()) }
        );
    }

    #[test]
    fn sendfile_with_target() {
        assert_eq!(
            parse("!sendfile=report.txt,size=1024,crc=0xabc1234,target=bob2").unwrap(),
            Command::SendFile {
                offer: FileOffer { filename: "report.txt".to_string(), size: 1024, crc: 0x0abc_1234 },
                target: Some("bob2".to_string()),
            }
        );
        assert!(parse("!sendfile=report.txt,size=big,crc=0x1").is_err());
        assert!(parse("!sendfile=report.txt,size=1,crc=zz").is_err());
    }

    #[test]
    fn reject_and_cancel_keep_reason_text() {
        assert_eq!(
            parse("!rejectfile=bob,reason=no thanks, busy").unwrap(),
            Command::RejectFile { user: "bob".to_string(), reason: "no thanks, busy".to_string() }
        );
        assert_eq!(
            parse("!cancelfile=bob").unwrap(),
            Command::CancelFile { user: "bob".to_string(), reason: String::new() }
        );
    }

    #[test]
    fn channel_claims() {
        let cmd =
            parse("!xfersend=a.bin,size=3,crc=1f,sender=bob,receiver=carol,token=abc").unwrap();
        let Command::TransferSend(claim) = cmd else { panic!("expected xfersend") };
        assert_eq!(claim.sender, "bob");
        assert_eq!(claim.receiver, "carol");
        assert_eq!(claim.offer.crc, 0x1f);

        assert!(parse("!xferrecv=a.bin,size=3,crc=1f,sender=bob,receiver=carol").is_err());
    }

    #[test]
    fn group_file_commands() {
        assert_eq!(
            parse("!putfile=team,file=a.txt,size=5,crc=0x10").unwrap(),
            Command::PutFile {
                group: "team".to_string(),
                offer: FileOffer { filename: "a.txt".to_string(), size: 5, crc: 0x10 },
            }
        );
        assert_eq!(
            parse("!getfile=team 3").unwrap(),
            Command::GetFile { group: "team".to_string(), file_id: 3 }
        );
        assert_eq!(
            parse("!removefile=team,3").unwrap(),
            Command::RemoveFile { group: "team".to_string(), file_id: 3 }
        );
        assert!(parse("!getfile=team x").is_err());
    }

    #[test]
    fn unknown_and_invalid() {
        assert_eq!(parse("!frobnicate=1"), Err(ProtocolError::UnknownCommand("frobnicate".to_string())));
        assert_eq!(Command::parse(&[0xff, 0xfe]), Err(ProtocolError::InvalidUtf8));
        assert_eq!(parse("!close").unwrap(), Command::Close);
    }
}
