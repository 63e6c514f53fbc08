//! Remote-to-local tunnel
//!
//! Connects streams opened by the peer to their targets.

use super::relay::{relay_tcp, relay_udp};
use super::StreamHandle;
use crate::protocol::Protocol;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Target side of the tunnel
#[derive(Debug, Clone)]
pub struct RemoteToLocalTunnel {
    udp_send_from: IpAddr,
    connect_timeout: Duration,
    cancel: CancellationToken,
}

impl RemoteToLocalTunnel {
    pub fn new(udp_send_from: IpAddr, connect_timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            udp_send_from,
            connect_timeout,
            cancel,
        }
    }

    /// Connect a stream opened by the peer and relay it in the background
    pub fn accept(&self, handle: StreamHandle) {
        let tunnel = self.clone();
        tokio::spawn(async move {
            match handle.protocol() {
                Protocol::Tcp => tunnel.connect_tcp(handle).await,
                Protocol::Udp => tunnel.connect_udp(handle).await,
            }
        });
    }

    async fn connect_tcp(self, handle: StreamHandle) {
        let stream_id = handle.id();
        let target = handle.target().to_string();

        let connected = tokio::select! {
            connected = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&target)) => {
                connected.unwrap_or_else(|_| {
                    Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))
                })
            }
            _ = self.cancel.cancelled() => return,
        };

        match connected {
            Ok(socket) => {
                info!("Stream {} connected to {}", stream_id, target);
                if handle.writer().opened().await.is_err() {
                    return;
                }
                relay_tcp(socket, handle, self.cancel).await;
            }
            Err(e) => {
                warn!("Stream {} failed to connect to {}: {}", stream_id, target, e);
                let _ = handle.writer().reset().await;
            }
        }
    }

    async fn connect_udp(self, handle: StreamHandle) {
        let stream_id = handle.id();
        let target = handle.target().to_string();

        match self.bind_udp(&target).await {
            Ok(socket) => {
                debug!("Stream {} sending datagrams to {}", stream_id, target);
                if handle.writer().opened().await.is_err() {
                    return;
                }
                relay_udp(socket, handle, self.cancel).await;
            }
            Err(e) => {
                warn!("Stream {} cannot reach {}: {}", stream_id, target, e);
                let _ = handle.writer().reset().await;
            }
        }
    }

    async fn bind_udp(&self, target: &str) -> io::Result<UdpSocket> {
        let socket = UdpSocket::bind(SocketAddr::new(self.udp_send_from, 0)).await?;
        socket.connect(target).await?;
        Ok(socket)
    }
}
