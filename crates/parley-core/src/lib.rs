//! Parley core: environment abstraction and framed connections.
//!
//! Everything here is synchronous and socket-agnostic. The server crate plugs
//! in tokio sockets; tests plug in [`memory_socket`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod connection;
pub mod env;
pub mod error;
pub mod memory_socket;

pub use connection::{Connection, PendingMessage, PendingOp, SendStatus, Socket};
pub use env::Environment;
pub use error::ConnectionError;
