//! TCP transport.
//!
//! Binds the listener and adapts accepted tokio streams to the synchronous
//! [`Socket`] trait. The driver only ever calls `try_read` / `try_write`, so
//! it never blocks; the per-connection task awaits readiness on the same
//! stream through a shared handle.

use std::{io, net::SocketAddr, sync::Arc};

use parley_core::Socket;
use tokio::net::{TcpListener, TcpStream};

use crate::error::ServerError;

/// Listening TCP endpoint.
#[derive(Debug)]
pub struct TcpTransport {
    listener: TcpListener,
}

impl TcpTransport {
    /// Bind a listener.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` if the address does not parse
    /// - `ServerError::Transport` if the bind fails
    pub async fn bind(address: &str) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::Config(format!("invalid bind address '{address}': {e}")))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Transport(format!("failed to bind {addr}: {e}")))?;

        tracing::info!("TCP transport bound to {}", addr);

        Ok(Self { listener })
    }

    /// Accept the next connection.
    ///
    /// # Errors
    ///
    /// - `ServerError::Transport` on accept failure
    pub async fn accept(&self) -> Result<(TcpSocket, SocketAddr), ServerError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        Ok((TcpSocket::new(stream), peer))
    }

    /// Local address the listener is bound to.
    ///
    /// # Errors
    ///
    /// - `ServerError::Transport` if the address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }
}

/// Accepted TCP stream shared between the driver and its connection task.
#[derive(Debug, Clone)]
pub struct TcpSocket {
    stream: Arc<TcpStream>,
}

impl TcpSocket {
    fn new(stream: TcpStream) -> Self {
        Self { stream: Arc::new(stream) }
    }

    /// Handle for awaiting readiness.
    pub fn stream(&self) -> Arc<TcpStream> {
        Arc::clone(&self.stream)
    }
}

impl Socket for TcpSocket {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.try_read(buf)
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.try_write(buf)
    }
}
