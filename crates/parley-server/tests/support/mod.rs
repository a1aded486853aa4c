//! Shared harness for driver-level integration tests.
//!
//! Drives a `ServerDriver` over in-memory sockets with a manually advanced
//! clock, standing in for the tokio runtime.

#![allow(dead_code)]

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use parley_core::{
    Environment,
    memory_socket::{MemoryPeer, MemorySocket, memory_pair},
};
use parley_server::{
    ConnId, DriverConfig, MemoryFileStore, Readiness, ServerAction, ServerDriver, ServerEvent,
};

/// Test environment: manual clock, thread RNG.
#[derive(Clone)]
pub struct ManualEnv {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualEnv {
    #[allow(clippy::disallowed_methods)]
    pub fn new() -> Self {
        Self { base: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    pub fn advance(&self, by: Duration) {
        *self.offset.lock().expect("Mutex poisoned") += by;
    }
}

impl Environment for ManualEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        self.base + *self.offset.lock().expect("Mutex poisoned")
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let offset = Arc::clone(&self.offset);
        async move {
            *offset.lock().expect("Mutex poisoned") += duration;
        }
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        use rand::RngCore;
        rand::thread_rng().fill_bytes(buffer);
    }
}

pub type Driver = ServerDriver<ManualEnv, MemorySocket, MemoryFileStore>;

/// Client side of one connection.
pub struct Client {
    pub conn: ConnId,
    pub peer: MemoryPeer,
}

impl Client {
    pub fn messages(&self) -> Vec<String> {
        self.peer.take_messages()
    }

    /// Next message starting with `prefix`, discarding everything before it.
    pub fn expect(&self, prefix: &str) -> String {
        let messages = self.messages();
        messages
            .iter()
            .find(|m| m.starts_with(prefix))
            .cloned()
            .unwrap_or_else(|| panic!("no message starting with {prefix:?} in {messages:?}"))
    }
}

pub struct Harness {
    pub driver: Driver,
    pub env: ManualEnv,
    pub store: MemoryFileStore,
    next_conn: ConnId,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(DriverConfig::default())
    }

    pub fn with_config(config: DriverConfig) -> Self {
        let env = ManualEnv::new();
        let store = MemoryFileStore::new();
        let driver = ServerDriver::new(env.clone(), store.clone(), config);
        Self { driver, env, store, next_conn: 1 }
    }

    pub fn process(&mut self, event: ServerEvent<MemorySocket>) -> Vec<ServerAction> {
        self.driver.process_event(event).expect("event should be accepted")
    }

    /// Accept a connection from 10.0.0.`host`.
    pub fn connect_from(&mut self, host: u8) -> (Client, Vec<ServerAction>) {
        let conn = self.next_conn;
        self.next_conn += 1;

        let (socket, peer) = memory_pair();
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), 40_000);
        let actions =
            self.process(ServerEvent::ConnectionAccepted { conn_id: conn, peer: addr, socket });
        (Client { conn, peer }, actions)
    }

    pub fn connect(&mut self) -> Client {
        let host = (self.next_conn % 250) as u8 + 1;
        self.connect_from(host).0
    }

    /// Connect and register; the client's inbox is drained.
    pub fn register(&mut self, name: &str) -> Client {
        let client = self.connect();
        self.send(&client, &format!("!register:username={name}"));
        client.messages();
        client
    }

    pub fn send(&mut self, client: &Client, line: &str) -> Vec<ServerAction> {
        client.peer.send_message(line.as_bytes());
        self.readable(client)
    }

    pub fn send_raw(&mut self, client: &Client, bytes: &[u8]) -> Vec<ServerAction> {
        client.peer.send_raw(bytes);
        self.readable(client)
    }

    pub fn readable(&mut self, client: &Client) -> Vec<ServerAction> {
        self.ready(client, Readiness::READABLE)
    }

    pub fn ready(&mut self, client: &Client, readiness: Readiness) -> Vec<ServerAction> {
        self.process(ServerEvent::Ready { conn_id: client.conn, readiness })
    }

    pub fn hangup(&mut self, client: &Client) -> Vec<ServerAction> {
        client.peer.close();
        self.ready(client, Readiness::HANGUP)
    }

    /// Advance the clock and deliver a tick.
    pub fn elapse(&mut self, by: Duration) -> Vec<ServerAction> {
        self.env.advance(by);
        self.process(ServerEvent::Tick)
    }

    /// Offer readable and writable readiness to every live channel, enough
    /// rounds for a few hundred pieces.
    pub fn pump(&mut self, clients: &[&Client]) {
        let readiness = Readiness { hangup: false, readable: true, writable: true };
        for _ in 0..256 {
            for client in clients {
                if self.driver.registry().entry(client.conn).is_some() {
                    self.ready(client, readiness);
                }
            }
        }
    }
}

pub fn closed(actions: &[ServerAction], conn: ConnId) -> bool {
    actions.iter().any(|a| matches!(a, ServerAction::Close { conn_id, .. } if *conn_id == conn))
}

/// Token field of a notice such as `!sendfileok=...,token=XYZ`.
pub fn token_of(notice: &str) -> String {
    notice
        .rsplit_once("token=")
        .map(|(_, token)| token.to_string())
        .unwrap_or_else(|| panic!("no token in {notice:?}"))
}

pub fn crc_hex(data: &[u8]) -> String {
    format!("{:#x}", crc32fast::hash(data))
}
