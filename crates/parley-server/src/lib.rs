//! Parley production server.
//!
//! Multi-user chat and file-relay server over plain TCP, using Tokio for the
//! async runtime, the local file system for group uploads, and system time
//! with OS randomness for transfer tokens.
//!
//! # Architecture
//!
//! The [`ServerDriver`] follows the Sans-IO pattern: it consumes readiness
//! events and returns actions. [`Server`] executes those actions with a small
//! tokio runtime:
//!
//! - one accept loop
//! - one readiness task per connection, armed with the interest the driver
//!   last requested
//! - one tick task for transfer invite expiry
//! - one console task reading operator commands from standard input
//!
//! All tasks serialize on a single lock around the driver, so every state
//! transition happens in exactly one place.
//!
//! # Components
//!
//! - [`ServerDriver`]: Action-based orchestrator (pure logic, no I/O)
//! - [`Server`]: Production runtime that executes ServerDriver actions
//! - [`TcpTransport`]: TCP listener and non-blocking socket adapter
//! - [`SystemEnv`]: Production environment (real time, OS RNG)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
mod driver;
mod error;
pub mod group_manager;
pub mod registry;
mod server_error;
pub mod storage;
mod system_env;
pub mod timer;
pub mod transfer;
mod transport;

use std::{collections::HashMap, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

pub use admin::{AdminCommand, AdminError, BanTarget};
pub use driver::{
    DriverConfig, LogLevel, Readiness, ServerAction, ServerDriver, ServerEvent,
};
pub use error::ServerError;
pub use group_manager::{GroupAction, GroupError, GroupManager, LOBBY};
pub use registry::{ConnId, ConnectionRegistry, Interest, RegistryError, Role, UserSession};
pub use server_error::DriverError;
pub use storage::{DiskStore, FileStore, MemoryFileStore, StorageError};
pub use system_env::SystemEnv;
use tokio::{
    io::AsyncBufReadExt,
    net::TcpStream,
    sync::{Mutex, Notify, watch},
};
pub use transfer::{TransferAction, TransferError, TransferRelay};
pub use transport::{TcpSocket, TcpTransport};

/// How often pending transfer invites are checked for expiry.
pub const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Server configuration for the production runtime.
#[derive(Debug, Clone)]
pub struct ServerRuntimeConfig {
    /// Address to bind to (e.g., "0.0.0.0:9000")
    pub bind_address: String,
    /// Directory holding one subdirectory per group
    pub storage_root: PathBuf,
    /// Driver configuration (timeouts, limits)
    pub driver: DriverConfig,
    /// Read operator commands from standard input
    pub admin_console: bool,
}

impl Default for ServerRuntimeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".to_string(),
            storage_root: PathBuf::from("parley-files"),
            driver: DriverConfig::default(),
            admin_console: true,
        }
    }
}

type Driver = ServerDriver<SystemEnv, TcpSocket, DiskStore>;

/// What a connection task should wait for.
#[derive(Debug, Clone, Copy)]
struct Control {
    interest: Interest,
}

/// Driver plus the control channels of every live connection task.
struct RuntimeState {
    driver: Driver,
    /// Dropping a sender stops its task
    tasks: HashMap<ConnId, watch::Sender<Control>>,
    shutdown: Arc<Notify>,
}

type Shared = Arc<Mutex<RuntimeState>>;

/// Production Parley server.
///
/// Wraps `ServerDriver` with TCP transport, disk storage and system
/// environment.
pub struct Server {
    /// The action-based server driver
    driver: Driver,
    /// Listening socket
    transport: TcpTransport,
    /// Whether to spawn the console task
    admin_console: bool,
}

impl Server {
    /// Create and bind a new server.
    ///
    /// # Errors
    ///
    /// - `ServerError::Config` for an unparsable bind address
    /// - `ServerError::Transport` if the bind fails
    /// - `ServerError::Storage` if the storage root cannot be created
    pub async fn bind(config: ServerRuntimeConfig) -> Result<Self, ServerError> {
        let store = DiskStore::open(&config.storage_root)?;
        let driver = ServerDriver::new(SystemEnv::new(), store, config.driver);
        let transport = TcpTransport::bind(&config.bind_address).await?;

        Ok(Self { driver, transport, admin_console: config.admin_console })
    }

    /// Local address the server is bound to.
    ///
    /// # Errors
    ///
    /// - `ServerError::Transport` if the address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.transport.local_addr()
    }

    /// Run the server until an operator `!shutdown`.
    ///
    /// # Errors
    ///
    /// - `ServerError::Transport` if the local address cannot be read
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Server starting on {}", self.transport.local_addr()?);

        let shutdown = Arc::new(Notify::new());
        let shared: Shared = Arc::new(Mutex::new(RuntimeState {
            driver: self.driver,
            tasks: HashMap::new(),
            shutdown: Arc::clone(&shutdown),
        }));

        let ticker = tokio::spawn(run_ticker(Arc::clone(&shared)));
        let console = self.admin_console.then(|| tokio::spawn(run_console(Arc::clone(&shared))));

        let mut next_id: ConnId = 1;
        loop {
            tokio::select! {
                () = shutdown.notified() => break,
                accepted = self.transport.accept() => match accepted {
                    Ok((socket, peer)) => {
                        let conn_id = next_id;
                        next_id += 1;
                        accept_connection(&shared, conn_id, socket, peer).await;
                    },
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
            }
        }

        ticker.abort();
        if let Some(console) = console {
            console.abort();
        }
        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn accept_connection(shared: &Shared, conn_id: ConnId, socket: TcpSocket, peer: SocketAddr) {
    let stream = socket.stream();
    let (control_tx, control_rx) = watch::channel(Control { interest: Interest::READ });

    {
        let mut state = shared.lock().await;
        state.tasks.insert(conn_id, control_tx);
        let event = ServerEvent::ConnectionAccepted { conn_id, peer, socket };
        match state.driver.process_event(event) {
            Ok(actions) => execute_actions(&mut state, actions),
            Err(e) => {
                tracing::error!("Accept of {} failed: {}", conn_id, e);
                state.tasks.remove(&conn_id);
                return;
            },
        }
        if !state.tasks.contains_key(&conn_id) {
            return;
        }
    }

    tokio::spawn(watch_connection(conn_id, stream, control_rx, Arc::clone(shared)));
}

/// Wait for the readiness the driver asked for and report it.
async fn watch_connection(
    conn_id: ConnId,
    stream: Arc<TcpStream>,
    mut control: watch::Receiver<Control>,
    shared: Shared,
) {
    loop {
        let wanted = tokio_interest(control.borrow_and_update().interest);

        let readiness = tokio::select! {
            changed = control.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            },
            ready = stream.ready(wanted.unwrap_or(tokio::io::Interest::READABLE)), if wanted.is_some() => {
                match ready {
                    Ok(ready) => Readiness {
                        hangup: ready.is_read_closed() || ready.is_write_closed(),
                        readable: ready.is_readable(),
                        writable: ready.is_writable(),
                    },
                    Err(e) => {
                        tracing::debug!("Connection {} readiness error: {}", conn_id, e);
                        Readiness::HANGUP
                    },
                }
            },
        };

        let mut state = shared.lock().await;
        match state.driver.process_event(ServerEvent::Ready { conn_id, readiness }) {
            Ok(actions) => execute_actions(&mut state, actions),
            Err(e) => {
                tracing::debug!("Connection {} gone: {}", conn_id, e);
                state.tasks.remove(&conn_id);
                break;
            },
        }
    }
}

fn tokio_interest(interest: Interest) -> Option<tokio::io::Interest> {
    match (interest.read, interest.write) {
        (true, true) => Some(tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE),
        (true, false) => Some(tokio::io::Interest::READABLE),
        (false, true) => Some(tokio::io::Interest::WRITABLE),
        (false, false) => None,
    }
}

async fn run_ticker(shared: Shared) {
    let mut interval = tokio::time::interval(TICK_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let mut state = shared.lock().await;
        match state.driver.process_event(ServerEvent::Tick) {
            Ok(actions) => execute_actions(&mut state, actions),
            Err(e) => tracing::error!("Tick failed: {}", e),
        }
    }
}

async fn run_console(shared: Shared) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::info!("Console closed");
                return;
            },
            Err(e) => {
                tracing::warn!("Console read error: {}", e);
                return;
            },
        };

        let mut command = match AdminCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Console: {}", e);
                continue;
            },
        };

        if let Some(target) = command.ban_target_mut() {
            let online = shared.lock().await.driver.registry().is_online(&target.name);
            if !online {
                target.resolve().await;
            }
        }

        let mut state = shared.lock().await;
        match state.driver.process_event(ServerEvent::Admin(command)) {
            Ok(actions) => execute_actions(&mut state, actions),
            Err(e) => tracing::error!("Console command failed: {}", e),
        }
    }
}

/// Execute server actions.
fn execute_actions(state: &mut RuntimeState, actions: Vec<ServerAction>) {
    for action in actions {
        match action {
            ServerAction::SetInterest { conn_id, interest } => {
                if let Some(control) = state.tasks.get(&conn_id) {
                    control.send_replace(Control { interest });
                }
            },

            ServerAction::Close { conn_id, reason } => {
                tracing::debug!("Closing connection {}: {}", conn_id, reason);
                state.tasks.remove(&conn_id);
            },

            ServerAction::Shutdown => {
                state.tasks.clear();
                state.shutdown.notify_one();
            },

            ServerAction::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
        }
    }
}
