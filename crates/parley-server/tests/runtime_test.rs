//! End-to-end tests of the tokio runtime over real TCP sockets.

use std::time::Duration;

use parley_proto::{FrameHeader, encode_message};
use parley_server::{Server, ServerRuntimeConfig};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

async fn start() -> (std::net::SocketAddr, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".to_string(),
        storage_root: dir.path().join("files"),
        admin_console: false,
        ..ServerRuntimeConfig::default()
    };
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());
    (addr, dir)
}

async fn send(stream: &mut TcpStream, message: &str) {
    let mut wire = Vec::new();
    encode_message(message.as_bytes(), &mut wire).unwrap();
    stream.write_all(&wire).await.unwrap();
}

async fn receive(stream: &mut TcpStream) -> String {
    let mut header = [0u8; FrameHeader::SIZE];
    timeout(Duration::from_secs(5), stream.read_exact(&mut header)).await.unwrap().unwrap();
    let header = FrameHeader::from_bytes(&header).unwrap();

    let mut payload = vec![0u8; header.payload_len()];
    stream.read_exact(&mut payload).await.unwrap();
    String::from_utf8(payload).unwrap()
}

#[tokio::test]
async fn register_over_tcp() {
    let (addr, _dir) = start().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(&mut stream, "!register:username=bob").await;

    assert_eq!(receive(&mut stream).await, "!regreply:username=bob");
    assert_eq!(receive(&mut stream).await, "!userlist=bob");
    assert_eq!(receive(&mut stream).await, "!joinedgroup=lobby");
}

#[tokio::test]
async fn private_message_between_tcp_clients() {
    let (addr, _dir) = start().await;

    let mut bob = TcpStream::connect(addr).await.unwrap();
    send(&mut bob, "!register:username=bob").await;
    for _ in 0..3 {
        receive(&mut bob).await;
    }

    let mut carol = TcpStream::connect(addr).await.unwrap();
    send(&mut carol, "!register:username=carol").await;
    for _ in 0..3 {
        receive(&mut carol).await;
    }
    assert_eq!(receive(&mut bob).await, "!useronline=carol");
    assert_eq!(receive(&mut bob).await, "!groupjoined=lobby,user=carol");

    send(&mut carol, "@bob hi there").await;
    assert_eq!(receive(&mut bob).await, "!privmsg=carol hi there");
}

#[tokio::test]
async fn server_closes_on_close_command() {
    let (addr, _dir) = start().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    send(&mut stream, "!close").await;

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), stream.read(&mut buf)).await.unwrap().unwrap_or(0);
    assert_eq!(n, 0);
}
