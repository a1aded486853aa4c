//! Parley wire protocol.
//!
//! Two layers:
//!
//! - [`frame`]: `[SOH][u16 length][STX][payload]` framing, plus the
//!   `!longmsg=` form for payloads above the inline threshold
//! - [`command`] / [`notice`]: the text commands carried inside frames
//!
//! Nothing here touches sockets. Partial I/O is handled one layer up in
//! `parley-core`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod command;
pub mod errors;
pub mod frame;
pub mod notice;

pub use command::{ChannelClaim, Command, FileOffer};
pub use errors::{ProtocolError, Result};
pub use frame::{Frame, FrameHeader, LongMessageHeader, encode_message};
pub use notice::{ErrorCode, FileListing, Notice};
