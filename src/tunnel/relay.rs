//! Relays between streams and real sockets

use super::{StreamEvent, StreamHandle, StreamWriter, MAX_PAYLOAD_SIZE};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Socket read size; a multiple of this never exceeds one frame
const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Relay a TCP socket over a stream until both directions are closed
///
/// Local EOF sends CLOSE while inbound data keeps draining; a received CLOSE
/// shuts down the socket's write side. Errors on either side abort the
/// stream.
pub async fn relay_tcp(socket: TcpStream, handle: StreamHandle, cancel: CancellationToken) {
    let _ = socket.set_nodelay(true);
    let stream_id = handle.id();
    let (read_half, write_half) = socket.into_split();
    let (writer, events) = handle.split();
    let abort = cancel.child_token();

    tokio::join!(
        socket_to_stream(read_half, writer.clone(), abort.clone()),
        stream_to_socket(events, write_half, writer, abort.clone()),
    );
    trace!("Stream {} relay finished", stream_id);
}

async fn socket_to_stream(mut socket: OwnedReadHalf, stream: StreamWriter, abort: CancellationToken) {
    let stream_id = stream.id();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let read = tokio::select! {
            read = socket.read(&mut buf) => read,
            _ = abort.cancelled() => return,
        };
        match read {
            Ok(0) => {
                debug!("Stream {} local EOF", stream_id);
                let _ = stream.close().await;
                return;
            }
            Ok(n) => {
                let data = Bytes::copy_from_slice(&buf[..n]);
                if stream.send(data).await.is_err() {
                    abort.cancel();
                    return;
                }
            }
            Err(e) => {
                debug!("Stream {} socket read error: {}", stream_id, e);
                let _ = stream.reset().await;
                abort.cancel();
                return;
            }
        }
    }
}

async fn stream_to_socket(
    mut events: mpsc::UnboundedReceiver<StreamEvent>,
    mut socket: OwnedWriteHalf,
    stream: StreamWriter,
    abort: CancellationToken,
) {
    let stream_id = stream.id();
    loop {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = abort.cancelled() => return,
        };
        match event {
            Some(StreamEvent::Opened) => trace!("Stream {} confirmed by peer", stream_id),
            Some(StreamEvent::Data(data)) => {
                if let Err(e) = socket.write_all(&data).await {
                    debug!("Stream {} socket write error: {}", stream_id, e);
                    let _ = stream.reset().await;
                    abort.cancel();
                    return;
                }
            }
            Some(StreamEvent::Close) => {
                debug!("Stream {} closed by peer", stream_id);
                let _ = socket.shutdown().await;
                return;
            }
            Some(StreamEvent::Reset) | None => {
                debug!("Stream {} aborted", stream_id);
                abort.cancel();
                return;
            }
        }
    }
}

/// Relay a connected UDP socket over a datagram stream
///
/// Ends when the stream is reset, which includes idle collection.
pub async fn relay_udp(socket: UdpSocket, handle: StreamHandle, cancel: CancellationToken) {
    let stream_id = handle.id();
    let (stream, mut events) = handle.split();
    let mut buf = vec![0u8; MAX_PAYLOAD_SIZE];

    loop {
        tokio::select! {
            received = socket.recv(&mut buf) => match received {
                Ok(n) => {
                    let datagram = Bytes::copy_from_slice(&buf[..n]);
                    if stream.send(datagram).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    // ICMP unreachable surfaces here; the target may come back
                    trace!("Stream {} UDP receive error: {}", stream_id, e);
                }
            },
            event = events.recv() => match event {
                Some(StreamEvent::Data(datagram)) => {
                    if let Err(e) = socket.send(&datagram).await {
                        trace!("Stream {} UDP send error: {}", stream_id, e);
                    }
                }
                Some(StreamEvent::Opened) => {}
                Some(StreamEvent::Close) | Some(StreamEvent::Reset) | None => break,
            },
            _ = cancel.cancelled() => break,
        }
    }
    trace!("Stream {} UDP relay finished", stream_id);
}
