//! Operator console commands.
//!
//! The console reads lines from standard input. Lines starting with a known
//! `!command` are operator actions; every other line is posted to the lobby as
//! an admin message.

use std::net::IpAddr;

use thiserror::Error;

/// Target of `!banip` / `!unbanip`: a user name, an IP literal or a host name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanTarget {
    /// Argument as typed
    pub name: String,
    /// Address the argument resolves to, if it is not an online user
    pub resolved: Option<IpAddr>,
}

impl BanTarget {
    /// Target with IP literals resolved in place.
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), resolved: name.parse().ok() }
    }

    /// Resolve a host name through DNS unless already resolved.
    pub async fn resolve(&mut self) {
        if self.resolved.is_some() {
            return;
        }
        match tokio::net::lookup_host((self.name.as_str(), 0)).await {
            Ok(mut addrs) => self.resolved = addrs.next().map(|addr| addr.ip()),
            Err(e) => tracing::debug!(target = %self.name, "host lookup failed: {e}"),
        }
    }
}

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdminCommand {
    /// `!shutdown`
    Shutdown,
    /// `!bcast <msg>`
    Broadcast(String),
    /// `!delgroup <name>`
    DeleteGroup(String),
    /// `!dropuser <name>`
    DropUser(String),
    /// `!banip <user-or-host>`
    Ban(BanTarget),
    /// `!unbanip <user-or-host>`
    Unban(BanTarget),
    /// `!promoteuser <name>`
    Promote(String),
    /// `!demoteuser <name>`
    Demote(String),
    /// Anything else
    LobbyMessage(String),
}

/// Console parse errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdminError {
    /// A command was given without its argument
    #[error("{0} needs an argument")]
    MissingArgument(&'static str),
}

impl AdminCommand {
    /// Parse one console line. Blank lines yield `None`.
    ///
    /// # Errors
    ///
    /// - `AdminError::MissingArgument` if a known command lacks its argument
    pub fn parse(line: &str) -> Result<Option<Self>, AdminError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return Ok(None);
        }

        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();

        let arg = |name: &'static str| {
            if rest.is_empty() { Err(AdminError::MissingArgument(name)) } else { Ok(rest) }
        };

        let parsed = match command {
            "!shutdown" => Self::Shutdown,
            "!bcast" => Self::Broadcast(arg("!bcast")?.to_string()),
            "!delgroup" => Self::DeleteGroup(arg("!delgroup")?.to_string()),
            "!dropuser" => Self::DropUser(arg("!dropuser")?.to_string()),
            "!banip" => Self::Ban(BanTarget::new(arg("!banip")?)),
            "!unbanip" => Self::Unban(BanTarget::new(arg("!unbanip")?)),
            "!promoteuser" => Self::Promote(arg("!promoteuser")?.to_string()),
            "!demoteuser" => Self::Demote(arg("!demoteuser")?.to_string()),
            _ => Self::LobbyMessage(line.to_string()),
        };
        Ok(Some(parsed))
    }

    /// Ban target awaiting DNS resolution, if any.
    pub fn ban_target_mut(&mut self) -> Option<&mut BanTarget> {
        match self {
            Self::Ban(target) | Self::Unban(target) => Some(target),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_commands() {
        assert_eq!(AdminCommand::parse("!shutdown"), Ok(Some(AdminCommand::Shutdown)));
        assert_eq!(
            AdminCommand::parse("!bcast maintenance at noon\n"),
            Ok(Some(AdminCommand::Broadcast("maintenance at noon".into())))
        );
        assert_eq!(
            AdminCommand::parse("!dropuser bob"),
            Ok(Some(AdminCommand::DropUser("bob".into())))
        );
    }

    #[test]
    fn ban_targets_resolve_ip_literals() {
        let Ok(Some(AdminCommand::Ban(target))) = AdminCommand::parse("!banip 10.0.0.7") else {
            panic!("expected ban");
        };
        assert_eq!(target.resolved, Some(IpAddr::from([10, 0, 0, 7])));

        let Ok(Some(AdminCommand::Unban(target))) = AdminCommand::parse("!unbanip bob") else {
            panic!("expected unban");
        };
        assert_eq!(target.resolved, None);
    }

    #[test]
    fn other_lines_go_to_lobby() {
        assert_eq!(
            AdminCommand::parse("hello everyone"),
            Ok(Some(AdminCommand::LobbyMessage("hello everyone".into())))
        );
        assert_eq!(
            AdminCommand::parse("!frobnicate"),
            Ok(Some(AdminCommand::LobbyMessage("!frobnicate".into())))
        );
        assert_eq!(AdminCommand::parse("   "), Ok(None));
    }

    #[test]
    fn missing_argument() {
        assert_eq!(AdminCommand::parse("!delgroup"), Err(AdminError::MissingArgument("!delgroup")));
        assert_eq!(AdminCommand::parse("!banip  "), Err(AdminError::MissingArgument("!banip")));
    }
}
