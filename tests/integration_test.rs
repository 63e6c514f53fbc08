//! Integration tests for File Tunnel
//!
//! Runs two sessions against each other through files in a temporary
//! directory:
//! - TCP and UDP local forwards
//! - Remote forwards announced to the peer
//! - Purging of the shared files
//! - Liveness timeout

use file_tunnel::protocol::{FileHeader, Protocol};
use file_tunnel::{Config, Session};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn config(dir: &Path, write_to: &str, read_from: &str) -> Config {
    Config {
        read_from: dir.join(read_from),
        write_to: dir.join(write_to),
        read_duration_ms: 5,
        tunnel_timeout_ms: 5_000,
        udp_send_from: "127.0.0.1".to_string(),
        ..Config::default()
    }
}

async fn start(config: &Config) -> Session {
    Session::start(config.validate().unwrap(), CancellationToken::new())
        .await
        .unwrap()
}

/// Start both ends and give each a chance to see the other's file
async fn start_pair(a: &Config, b: &Config) -> (Session, Session) {
    let a = start(a).await;
    let b = start(b).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    (a, b)
}

async fn listen_addr(session: &Session, protocol: Protocol) -> SocketAddr {
    for _ in 0..200 {
        if let Some((_, addr)) = session
            .listen_addrs()
            .await
            .into_iter()
            .find(|(p, _)| *p == protocol)
        {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no {} listener", protocol);
}

async fn tcp_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        loop {
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&buf[..n], from).await.unwrap();
        }
    });
    addr
}

async fn round_trip(stream: &mut TcpStream, message: &[u8]) -> Vec<u8> {
    stream.write_all(message).await.unwrap();
    let mut buf = vec![0u8; message.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Epoch and length of a channel file, `None` while a purge is rewriting it
fn file_state(path: &Path) -> Option<(u64, u64)> {
    let bytes = std::fs::read(path).ok()?;
    let header = FileHeader::decode(&bytes).ok()??;
    Some((header.epoch, bytes.len() as u64))
}

/// PING through a local TCP forward comes back as PONG
#[tokio::test]
async fn test_tcp_forward_ping_pong() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();

    let mut a = config(dir.path(), "a-to-b", "b-to-a");
    a.tcp_forwards = vec![format!("127.0.0.1:0:127.0.0.1:{}", target.port())];
    let b = config(dir.path(), "b-to-a", "a-to-b");
    let (a, b) = start_pair(&a, &b).await;

    let entry = listen_addr(&a, Protocol::Tcp).await;
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(entry).await.unwrap();
        let (mut server, _) = listener.accept().await.unwrap();

        client.write_all(b"PING").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        server.write_all(b"PONG").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");

        // Half-close travels through the tunnel
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        server.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    })
    .await
    .unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

/// A connection made before the peer's next poll reaches the target
#[tokio::test]
async fn test_connection_before_peer_polls_again() {
    let dir = TempDir::new().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();

    // B polls once, finds nothing, and is asleep when A starts
    let mut b = config(dir.path(), "b-to-a", "a-to-b");
    b.read_duration_ms = 500;
    let b = start(&b).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut a = config(dir.path(), "a-to-b", "b-to-a");
    a.tcp_forwards = vec![format!("127.0.0.1:0:127.0.0.1:{}", target.port())];
    let a = start(&a).await;

    let entry = listen_addr(&a, Protocol::Tcp).await;
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(entry).await.unwrap();
        client.write_all(b"PING").await.unwrap();

        let (mut server, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PING");

        server.write_all(b"PONG").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"PONG");
    })
    .await
    .unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

/// Concurrent connections keep their data apart
#[tokio::test]
async fn test_concurrent_connections_isolated() {
    let dir = TempDir::new().unwrap();
    let echo = tcp_echo_server().await;

    let mut a = config(dir.path(), "a-to-b", "b-to-a");
    a.tcp_forwards = vec![format!("0:127.0.0.1:{}", echo.port())];
    let b = config(dir.path(), "b-to-a", "a-to-b");
    let (a, b) = start_pair(&a, &b).await;

    let entry = listen_addr(&a, Protocol::Tcp).await;
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut first = TcpStream::connect(entry).await.unwrap();
        let mut second = TcpStream::connect(entry).await.unwrap();

        for round in 0..5 {
            let one = format!("first connection, round {}", round);
            let two = format!("second connection, round {}", round);
            let (echo_one, echo_two) = tokio::join!(
                round_trip(&mut first, one.as_bytes()),
                round_trip(&mut second, two.as_bytes()),
            );
            assert_eq!(echo_one, one.as_bytes());
            assert_eq!(echo_two, two.as_bytes());
        }
    })
    .await
    .unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

/// A datagram crosses the tunnel as one datagram
#[tokio::test]
async fn test_udp_forward_keeps_datagram_whole() {
    let dir = TempDir::new().unwrap();
    let echo = udp_echo_server().await;

    let mut a = config(dir.path(), "a-to-b", "b-to-a");
    a.udp_forwards = vec![format!("127.0.0.1:0:127.0.0.1:{}", echo.port())];
    let b = config(dir.path(), "b-to-a", "a-to-b");
    let (a, b) = start_pair(&a, &b).await;

    let entry = listen_addr(&a, Protocol::Udp).await;
    tokio::time::timeout(TEST_TIMEOUT, async {
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let datagram: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();

        client.send_to(&datagram, entry).await.unwrap();
        let mut buf = vec![0u8; 2048];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(from, entry);
        assert_eq!(&buf[..n], &datagram[..]);

        // Same source, same stream
        client.send_to(b"again", entry).await.unwrap();
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"again");
    })
    .await
    .unwrap();

    a.shutdown().await;
    b.shutdown().await;
}

/// The peer listens for a remote forward and connects back through us
#[tokio::test]
async fn test_remote_forward() {
    let dir = TempDir::new().unwrap();
    let echo = tcp_echo_server().await;

    let mut a = config(dir.path(), "a-to-b", "b-to-a");
    a.remote_tcp_forwards = vec![format!("127.0.0.1:0:127.0.0.1:{}", echo.port())];
    let b = config(dir.path(), "b-to-a", "a-to-b");
    let (a, b) = start_pair(&a, &b).await;

    assert!(a.listen_addrs().await.is_empty());
    let entry = listen_addr(&b, Protocol::Tcp).await;
    tokio::time::timeout(TEST_TIMEOUT, async {
        let mut client = TcpStream::connect(entry).await.unwrap();
        assert_eq!(round_trip(&mut client, b"hello").await, b"hello");
    })
    .await
    .unwrap();

    // Re-announcements do not open a second listener
    assert_eq!(b.listen_addrs().await.len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

/// Purging keeps the files small without losing data
#[tokio::test]
async fn test_purge_keeps_stream_intact() {
    let dir = TempDir::new().unwrap();
    let echo = tcp_echo_server().await;

    let mut a = config(dir.path(), "a-to-b", "b-to-a");
    a.purge_size = 4096;
    a.tcp_forwards = vec![format!("127.0.0.1:0:127.0.0.1:{}", echo.port())];
    let mut b = config(dir.path(), "b-to-a", "a-to-b");
    b.purge_size = 4096;
    let (a, b) = start_pair(&a, &b).await;

    let a_file = dir.path().join("a-to-b");
    let b_file = dir.path().join("b-to-a");
    let (a_epoch, _) = file_state(&a_file).unwrap();
    let (b_epoch, _) = file_state(&b_file).unwrap();

    let entry = listen_addr(&a, Protocol::Tcp).await;
    let payload: Vec<u8> = (0..256 * 1024u32).map(|i| (i % 253) as u8).collect();
    tokio::time::timeout(TEST_TIMEOUT, async {
        let client = TcpStream::connect(entry).await.unwrap();
        let (mut reader, mut writer) = client.into_split();

        let sent = payload.clone();
        let send = tokio::spawn(async move {
            for chunk in sent.chunks(8192) {
                writer.write_all(chunk).await.unwrap();
            }
            writer
        });

        let mut received = vec![0u8; payload.len()];
        reader.read_exact(&mut received).await.unwrap();
        assert!(received == payload, "echoed data differs");
        drop(send.await.unwrap());
    })
    .await
    .unwrap();

    // Once traffic stops both files have been purged and stay small
    let purged = |path: &Path, initial: u64| match file_state(path) {
        Some((epoch, len)) => epoch != initial && len < 64 * 1024,
        None => false,
    };
    let mut settled = false;
    for _ in 0..200 {
        if purged(&a_file, a_epoch) && purged(&b_file, b_epoch) {
            settled = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(settled);

    a.shutdown().await;
    b.shutdown().await;
}

/// Streams are closed when the peer stops writing
#[tokio::test]
async fn test_silent_peer_closes_streams() {
    let dir = TempDir::new().unwrap();

    let mut a = config(dir.path(), "a-to-b", "b-to-a");
    a.tunnel_timeout_ms = 500;
    a.tcp_forwards = vec!["127.0.0.1:0:127.0.0.1:9".to_string()];
    let a = start(&a).await;

    let entry = listen_addr(&a, Protocol::Tcp).await;
    let mut client = TcpStream::connect(entry).await.unwrap();

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    a.shutdown().await;
}

/// Shutting one end down resets the connections it carried
#[tokio::test]
async fn test_peer_shutdown_resets_connections() {
    let dir = TempDir::new().unwrap();
    let echo = tcp_echo_server().await;

    let mut a = config(dir.path(), "a-to-b", "b-to-a");
    a.tcp_forwards = vec![format!("127.0.0.1:0:127.0.0.1:{}", echo.port())];
    let b = config(dir.path(), "b-to-a", "a-to-b");
    let (a, b) = start_pair(&a, &b).await;

    let entry = listen_addr(&a, Protocol::Tcp).await;
    let mut client = TcpStream::connect(entry).await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, async {
        assert_eq!(round_trip(&mut client, b"before").await, b"before");
    })
    .await
    .unwrap();

    b.shutdown().await;

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(TEST_TIMEOUT, client.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)));

    a.shutdown().await;
}
