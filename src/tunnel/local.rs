//! Local-to-remote tunnel
//!
//! Listens on the local end of each forwarding rule and carries every
//! accepted connection, or every UDP source address, as one stream.

use super::relay::relay_tcp;
use super::{StreamEvent, StreamId, StreamWriter, TunnelError, TunnelHandle, MAX_PAYLOAD_SIZE};
use crate::config::ForwardRule;
use crate::protocol::Protocol;
use bytes::Bytes;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

type UdpSessions = Arc<Mutex<HashMap<SocketAddr, StreamWriter>>>;

/// Listener side of the tunnel
pub struct LocalToRemoteTunnel {
    tunnel: TunnelHandle,
    cancel: CancellationToken,
    /// Bound address per (protocol, configured listen endpoint)
    active: Mutex<HashMap<(Protocol, String), SocketAddr>>,
    listeners: Mutex<JoinSet<()>>,
}

impl LocalToRemoteTunnel {
    pub fn new(tunnel: TunnelHandle, cancel: CancellationToken) -> Self {
        Self {
            tunnel,
            cancel,
            active: Mutex::new(HashMap::new()),
            listeners: Mutex::new(JoinSet::new()),
        }
    }

    /// Start listening for a rule. Returns the bound address, or `None` if
    /// the rule's listen endpoint is already served.
    pub async fn add_listener(&self, rule: &ForwardRule) -> Result<Option<SocketAddr>, TunnelError> {
        let key = (rule.protocol, rule.listen.to_string());
        let mut active = self.active.lock().await;
        if active.contains_key(&key) {
            debug!("Already listening for {}", rule);
            return Ok(None);
        }

        let target = rule.target.to_string();
        let cancel = self.cancel.clone();
        let tunnel = self.tunnel.clone();

        let addr = match rule.protocol {
            Protocol::Tcp => {
                let listener = TcpListener::bind(key.1.as_str()).await?;
                let addr = listener.local_addr()?;
                self.listeners
                    .lock()
                    .await
                    .spawn(accept_tcp(listener, target, tunnel, cancel));
                addr
            }
            Protocol::Udp => {
                let socket = UdpSocket::bind(key.1.as_str()).await?;
                let addr = socket.local_addr()?;
                self.listeners
                    .lock()
                    .await
                    .spawn(serve_udp(Arc::new(socket), target, tunnel, cancel));
                addr
            }
        };

        info!("Listening on {} {} for {}", rule.protocol, addr, rule.target);
        active.insert(key, addr);
        Ok(Some(addr))
    }

    /// Addresses currently listened on
    pub async fn listen_addrs(&self) -> Vec<(Protocol, SocketAddr)> {
        self.active
            .lock()
            .await
            .iter()
            .map(|((protocol, _), addr)| (*protocol, *addr))
            .collect()
    }

    /// Stop all listeners
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut listeners = self.listeners.lock().await;
        while let Some(result) = listeners.join_next().await {
            if let Err(e) = result {
                warn!("Listener task failed: {}", e);
            }
        }
    }
}

async fn accept_tcp(
    listener: TcpListener,
    target: String,
    tunnel: TunnelHandle,
    cancel: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };

        debug!("Accepted {} for {}", peer, target);
        tokio::spawn(forward_tcp(
            socket,
            peer,
            target.clone(),
            tunnel.clone(),
            cancel.clone(),
        ));
    }
}

async fn forward_tcp(
    socket: TcpStream,
    peer: SocketAddr,
    target: String,
    tunnel: TunnelHandle,
    cancel: CancellationToken,
) {
    match tunnel.open_stream(Protocol::Tcp, target).await {
        Ok(handle) => {
            debug!("Connection {} carried by stream {}", peer, handle.id());
            relay_tcp(socket, handle, cancel).await;
        }
        Err(e) => warn!("Cannot forward connection from {}: {}", peer, e),
    }
}

async fn serve_udp(
    socket: Arc<UdpSocket>,
    target: String,
    tunnel: TunnelHandle,
    cancel: CancellationToken,
) {
    let sessions: UdpSessions = Arc::new(Mutex::new(HashMap::new()));
    let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];

    loop {
        let (n, source) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    trace!("UDP receive error: {}", e);
                    continue;
                }
            },
            _ = cancel.cancelled() => break,
        };
        let datagram = Bytes::copy_from_slice(&buf[..n]);

        let existing = sessions.lock().await.get(&source).cloned();
        let writer = match existing {
            Some(writer) => writer,
            None => match tunnel.open_stream(Protocol::Udp, target.clone()).await {
                Ok(handle) => {
                    debug!("UDP source {} carried by stream {}", source, handle.id());
                    let (writer, events) = handle.split();
                    sessions.lock().await.insert(source, writer.clone());
                    tokio::spawn(return_datagrams(
                        socket.clone(),
                        source,
                        writer.id(),
                        events,
                        sessions.clone(),
                        cancel.clone(),
                    ));
                    writer
                }
                Err(e) => {
                    warn!("Cannot forward datagram from {}: {}", source, e);
                    continue;
                }
            },
        };

        if writer.send(datagram).await.is_err() {
            break;
        }
    }
}

/// Send datagrams from the peer back to the source of a UDP session
async fn return_datagrams(
    socket: Arc<UdpSocket>,
    source: SocketAddr,
    stream_id: StreamId,
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    sessions: UdpSessions,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = cancel.cancelled() => break,
        };
        match event {
            Some(StreamEvent::Data(datagram)) => {
                if let Err(e) = socket.send_to(&datagram, source).await {
                    trace!("UDP send to {} failed: {}", source, e);
                }
            }
            Some(StreamEvent::Opened) => {}
            Some(StreamEvent::Close) | Some(StreamEvent::Reset) | None => break,
        }
    }

    let mut sessions = sessions.lock().await;
    if sessions.get(&source).map(|writer| writer.id()) == Some(stream_id) {
        sessions.remove(&source);
    }
    trace!("UDP session {} ended", source);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::{FrameType, Multiplexer};

    fn rule(protocol: Protocol) -> ForwardRule {
        ForwardRule::parse(protocol, "127.0.0.1:0:10.0.0.5:3389").unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_listener_ignored() {
        let (mux, _commands) = Multiplexer::new(Duration::from_secs(60));
        let local = LocalToRemoteTunnel::new(mux.handle(), CancellationToken::new());

        assert!(local.add_listener(&rule(Protocol::Tcp)).await.unwrap().is_some());
        assert!(local.add_listener(&rule(Protocol::Tcp)).await.unwrap().is_none());
        assert!(local.add_listener(&rule(Protocol::Udp)).await.unwrap().is_some());
        assert_eq!(local.listen_addrs().await.len(), 2);

        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_accept_opens_stream() {
        let (mut mux, mut commands) = Multiplexer::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let local = LocalToRemoteTunnel::new(mux.handle(), cancel.clone());
        let addr = local.add_listener(&rule(Protocol::Tcp)).await.unwrap().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let cmd = tokio::time::timeout(Duration::from_secs(5), commands.recv())
            .await
            .unwrap()
            .unwrap();
        mux.process_command(cmd);

        let frames = mux.take_send_queue();
        assert_eq!(frames[0].frame_type, FrameType::Open);
        assert_eq!(
            frames[0].open_target().unwrap(),
            (Protocol::Tcp, "10.0.0.5:3389".to_string())
        );

        local.shutdown().await;
    }

    #[tokio::test]
    async fn test_udp_sources_get_own_streams() {
        let (mut mux, mut commands) = Multiplexer::new(Duration::from_secs(60));
        let local = LocalToRemoteTunnel::new(mux.handle(), CancellationToken::new());
        let addr = local.add_listener(&rule(Protocol::Udp)).await.unwrap().unwrap();

        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.send_to(b"one", addr).await.unwrap();

        // Open, then the datagram
        for _ in 0..2 {
            let cmd = tokio::time::timeout(Duration::from_secs(5), commands.recv())
                .await
                .unwrap()
                .unwrap();
            mux.process_command(cmd);
        }
        a.send_to(b"two", addr).await.unwrap();
        b.send_to(b"three", addr).await.unwrap();
        for _ in 0..3 {
            let cmd = tokio::time::timeout(Duration::from_secs(5), commands.recv())
                .await
                .unwrap()
                .unwrap();
            mux.process_command(cmd);
        }

        let frames = mux.take_send_queue();
        let opens = frames.iter().filter(|f| f.frame_type == FrameType::Open).count();
        let datagrams = frames
            .iter()
            .filter(|f| f.frame_type == FrameType::Data && f.is_datagram())
            .count();
        assert_eq!(opens, 2);
        assert_eq!(datagrams, 3);
        assert_eq!(mux.stream_count(), 2);

        local.shutdown().await;
    }
}
