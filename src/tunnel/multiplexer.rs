//! Stream multiplexer for the channel
//!
//! Owns the routing table of every stream riding on the shared file. The
//! multiplexer is driven by a single task; relay tasks talk to it through
//! [`StreamCommand`]s and receive [`StreamEvent`]s on a per-stream channel.

use super::{
    Frame, FrameType, Origin, StreamId, StreamState, TunnelError, TunnelStream,
    COMMAND_QUEUE_SIZE, MAX_STREAMS,
};
use crate::protocol::Protocol;
use bytes::Bytes;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Stream event sent from multiplexer to stream handlers
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    /// Peer confirmed its target socket
    Opened,
    /// Data received for stream
    Data(Bytes),
    /// Stream closed by remote
    Close,
    /// Stream aborted; the socket should be dropped
    Reset,
}

/// Command sent from stream handlers to multiplexer
#[derive(Debug)]
pub enum StreamCommand {
    /// Open new stream to target
    Open {
        protocol: Protocol,
        target: String,
        reply: oneshot::Sender<Result<StreamHandle, TunnelError>>,
    },
    /// Target socket connected
    Opened { stream_id: StreamId },
    /// Send data on stream
    Send { stream_id: StreamId, data: Bytes },
    /// Close stream gracefully
    Close { stream_id: StreamId },
    /// Abort stream
    Reset { stream_id: StreamId },
}

/// Something the peer asked this instance to do
#[derive(Debug)]
pub enum Incoming {
    /// A stream opened by the peer, to be connected to its target
    Stream(StreamHandle),
    /// Start a listener (remote forward requested by the peer)
    Listen {
        protocol: Protocol,
        listen: String,
        target: String,
    },
}

/// Cloneable sender half of a stream
#[derive(Debug, Clone)]
pub struct StreamWriter {
    stream_id: StreamId,
    cmd_tx: mpsc::Sender<StreamCommand>,
}

impl StreamWriter {
    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.stream_id
    }

    async fn command(&self, cmd: StreamCommand) -> Result<(), TunnelError> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|_| TunnelError::StreamClosed)
    }

    /// Send data on this stream
    pub async fn send(&self, data: Bytes) -> Result<(), TunnelError> {
        self.command(StreamCommand::Send {
            stream_id: self.stream_id,
            data,
        })
        .await
    }

    /// Confirm that the target socket is connected
    pub async fn opened(&self) -> Result<(), TunnelError> {
        self.command(StreamCommand::Opened {
            stream_id: self.stream_id,
        })
        .await
    }

    /// Close this stream
    pub async fn close(&self) -> Result<(), TunnelError> {
        self.command(StreamCommand::Close {
            stream_id: self.stream_id,
        })
        .await
    }

    /// Abort this stream
    pub async fn reset(&self) -> Result<(), TunnelError> {
        self.command(StreamCommand::Reset {
            stream_id: self.stream_id,
        })
        .await
    }
}

/// Stream handle for application use
#[derive(Debug)]
pub struct StreamHandle {
    writer: StreamWriter,
    protocol: Protocol,
    target: String,
    event_rx: mpsc::UnboundedReceiver<StreamEvent>,
}

impl StreamHandle {
    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.writer.stream_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Target endpoint of the stream
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Sender half, for confirming or aborting the stream
    pub fn writer(&self) -> &StreamWriter {
        &self.writer
    }

    /// Receive data or event
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.event_rx.recv().await
    }

    /// Split into a cloneable writer and the event receiver
    pub fn split(self) -> (StreamWriter, mpsc::UnboundedReceiver<StreamEvent>) {
        (self.writer, self.event_rx)
    }
}

/// Cloneable handle used by the tunnels to open streams
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    cmd_tx: mpsc::Sender<StreamCommand>,
}

impl TunnelHandle {
    /// Open a new stream to the given target
    pub async fn open_stream(
        &self,
        protocol: Protocol,
        target: String,
    ) -> Result<StreamHandle, TunnelError> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(StreamCommand::Open {
                protocol,
                target,
                reply,
            })
            .await
            .map_err(|_| TunnelError::StreamClosed)?;

        response.await.map_err(|_| TunnelError::StreamClosed)?
    }
}

/// Multiplexer state for a single stream
struct StreamEntry {
    stream: TunnelStream,
    event_tx: mpsc::UnboundedSender<StreamEvent>,
}

impl StreamEntry {
    fn notify(&self, event: StreamEvent) {
        // The relay may already be gone
        let _ = self.event_tx.send(event);
    }
}

/// Stream multiplexer
pub struct Multiplexer {
    /// Active streams
    streams: HashMap<StreamId, StreamEntry>,
    /// Next local stream number
    next_number: u32,
    /// Command sender (cloned for new stream handles)
    cmd_tx: mpsc::Sender<StreamCommand>,
    /// Pending frames to send
    send_queue: Vec<Frame>,
    /// Targets of peer-opened UDP streams, kept past idle collection
    udp_routes: HashMap<StreamId, String>,
    /// Idle time after which a UDP stream is dropped
    udp_idle_timeout: Duration,
}

impl Multiplexer {
    /// Create a new multiplexer and the receiver for its command queue
    pub fn new(udp_idle_timeout: Duration) -> (Self, mpsc::Receiver<StreamCommand>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let mux = Self {
            streams: HashMap::new(),
            next_number: 1,
            cmd_tx,
            send_queue: Vec::new(),
            udp_routes: HashMap::new(),
            udp_idle_timeout,
        };
        (mux, cmd_rx)
    }

    /// Handle for opening streams from other tasks
    pub fn handle(&self) -> TunnelHandle {
        TunnelHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    fn allocate_number(&mut self) -> u32 {
        loop {
            let number = self.next_number;
            self.next_number = if number >= StreamId::MAX_NUMBER {
                1
            } else {
                number + 1
            };
            if !self.streams.contains_key(&StreamId::local(number)) {
                return number;
            }
        }
    }

    fn insert(&mut self, stream: TunnelStream) -> StreamHandle {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = StreamHandle {
            writer: StreamWriter {
                stream_id: stream.id(),
                cmd_tx: self.cmd_tx.clone(),
            },
            protocol: stream.protocol(),
            target: stream.target().to_string(),
            event_rx,
        };
        self.streams
            .insert(stream.id(), StreamEntry { stream, event_tx });
        handle
    }

    /// Open a new stream to a target
    pub fn open_stream(
        &mut self,
        protocol: Protocol,
        target: String,
    ) -> Result<StreamHandle, TunnelError> {
        if self.streams.len() >= MAX_STREAMS {
            return Err(TunnelError::TooManyStreams(MAX_STREAMS));
        }

        let stream_id = StreamId::local(self.allocate_number());
        let mut stream = TunnelStream::new(stream_id, protocol, target);

        let seq = stream.next_send_seq();
        self.send_queue
            .push(Frame::open(stream_id.to_wire(), seq, protocol, stream.target()));

        debug!("Opening {} stream {} to {}", protocol, stream_id, stream.target());
        Ok(self.insert(stream))
    }

    /// Handle an incoming frame
    pub fn handle_frame(&mut self, frame: Frame) -> Option<Incoming> {
        match frame.frame_type {
            FrameType::Listen => match frame.listen_rule() {
                Ok((protocol, listen, target)) => Some(Incoming::Listen {
                    protocol,
                    listen,
                    target,
                }),
                Err(e) => {
                    warn!("Ignoring listen request: {}", e);
                    None
                }
            },
            FrameType::Ping | FrameType::Purge | FrameType::PurgeAck => None,
            FrameType::Open | FrameType::Opened | FrameType::Data | FrameType::Close => {
                let Some(stream_id) = StreamId::from_wire(frame.stream_id) else {
                    debug!("Dropping {:?} frame without stream id", frame.frame_type);
                    return None;
                };
                match frame.frame_type {
                    FrameType::Open => self.handle_open(stream_id, frame),
                    FrameType::Opened => {
                        self.handle_opened(stream_id, frame);
                        None
                    }
                    FrameType::Data => self.handle_data(stream_id, frame),
                    _ => {
                        self.handle_close(stream_id, frame);
                        None
                    }
                }
            }
        }
    }

    /// Handle stream open request from the peer
    fn handle_open(&mut self, stream_id: StreamId, frame: Frame) -> Option<Incoming> {
        if stream_id.origin != Origin::Remote {
            warn!("Peer tried to open stream {} in the local id range", stream_id);
            return None;
        }

        if let Some(old) = self.streams.remove(&stream_id) {
            warn!("Stream {} reopened by peer, dropping old stream", stream_id);
            old.notify(StreamEvent::Reset);
        }

        let (protocol, target) = match frame.open_target() {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("Rejecting stream {}: {}", stream_id, e);
                self.send_queue
                    .push(Frame::close(stream_id.to_wire(), 0, true));
                return None;
            }
        };

        if self.streams.len() >= MAX_STREAMS {
            warn!("Rejecting stream {}: too many streams", stream_id);
            self.send_queue
                .push(Frame::close(stream_id.to_wire(), 0, true));
            return None;
        }

        if protocol == Protocol::Udp {
            self.remember_udp_route(stream_id, &target);
        }

        debug!("Peer opened {} stream {} to {}", protocol, stream_id, target);
        let stream = TunnelStream::accepted(stream_id, protocol, target, frame.sequence);
        Some(Incoming::Stream(self.insert(stream)))
    }

    fn remember_udp_route(&mut self, stream_id: StreamId, target: &str) {
        if self.udp_routes.len() >= MAX_STREAMS {
            let streams = &self.streams;
            self.udp_routes.retain(|id, _| streams.contains_key(id));
        }
        self.udp_routes.insert(stream_id, target.to_string());
    }

    /// Handle target-connected confirmation
    fn handle_opened(&mut self, stream_id: StreamId, frame: Frame) {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            debug!("Open confirmation for unknown stream {}", stream_id);
            return;
        };
        if let Err(e) = entry.stream.accept_seq(frame.sequence) {
            self.hard_reset(stream_id, e);
            return;
        }
        entry.stream.mark_open();
        entry.notify(StreamEvent::Opened);
    }

    /// Handle incoming data frame
    fn handle_data(&mut self, stream_id: StreamId, frame: Frame) -> Option<Incoming> {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return self.handle_orphan_data(stream_id, frame);
        };

        if let Err(e) = entry.stream.accept_seq(frame.sequence) {
            self.hard_reset(stream_id, e);
            return None;
        }

        if !entry.stream.can_recv() {
            trace!("Dropping data for closing stream {}", stream_id);
            return None;
        }

        // Data from the peer's side of our stream implies its socket is up
        if stream_id.origin == Origin::Local {
            entry.stream.mark_open();
        }

        entry.notify(StreamEvent::Data(frame.payload));
        None
    }

    /// Data for a stream that is not in the table
    fn handle_orphan_data(&mut self, stream_id: StreamId, frame: Frame) -> Option<Incoming> {
        let route = match self.udp_routes.get(&stream_id) {
            Some(target) if frame.is_datagram() && stream_id.origin == Origin::Remote => {
                target.clone()
            }
            _ => {
                debug!(
                    "Received data for unknown stream {} ({} bytes)",
                    stream_id,
                    frame.payload.len()
                );
                return None;
            }
        };

        if self.streams.len() >= MAX_STREAMS {
            debug!("Dropping datagram for stream {}: too many streams", stream_id);
            return None;
        }

        debug!("Recreating UDP stream {} to {}", stream_id, route);
        let stream = TunnelStream::accepted(stream_id, Protocol::Udp, route, frame.sequence);
        let handle = self.insert(stream);
        if let Some(entry) = self.streams.get(&stream_id) {
            entry.notify(StreamEvent::Data(frame.payload));
        }
        Some(Incoming::Stream(handle))
    }

    /// Handle stream close from remote
    fn handle_close(&mut self, stream_id: StreamId, frame: Frame) {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            debug!("Close for unknown stream {}", stream_id);
            return;
        };

        if let Err(e) = entry.stream.accept_seq(frame.sequence) {
            self.hard_reset(stream_id, e);
            return;
        }

        if frame.is_reset() {
            debug!("Peer reset stream {}", stream_id);
            entry.stream.force_close();
            entry.notify(StreamEvent::Reset);
            self.streams.remove(&stream_id);
            return;
        }

        entry.stream.close_remote();
        entry.notify(StreamEvent::Close);

        if entry.stream.is_closed() {
            debug!("Stream {} closed", stream_id);
            self.streams.remove(&stream_id);
        }
    }

    /// Abort a stream whose frames can no longer be trusted
    fn hard_reset(&mut self, stream_id: StreamId, reason: TunnelError) {
        warn!("Resetting stream {}: {}", stream_id, reason);
        if let Some(entry) = self.streams.remove(&stream_id) {
            self.abort(stream_id, entry);
        }
    }

    /// Notify the relay and tell the peer, without waiting for its CLOSE
    fn abort(&mut self, stream_id: StreamId, mut entry: StreamEntry) {
        if entry.stream.protocol() == Protocol::Tcp && !entry.stream.is_closed() {
            let seq = entry.stream.next_send_seq();
            self.send_queue
                .push(Frame::close(stream_id.to_wire(), seq, true));
        }
        entry.stream.force_close();
        entry.notify(StreamEvent::Reset);
    }

    /// Process a command from a stream handle
    pub fn process_command(&mut self, cmd: StreamCommand) {
        match cmd {
            StreamCommand::Open {
                protocol,
                target,
                reply,
            } => {
                let result = self.open_stream(protocol, target);
                if let Err(Ok(handle)) = reply.send(result) {
                    // Requester went away before the stream was handed over
                    self.process_command(StreamCommand::Reset {
                        stream_id: handle.id(),
                    });
                }
            }
            StreamCommand::Opened { stream_id } => {
                if let Some(entry) = self.streams.get_mut(&stream_id) {
                    if entry.stream.state() == StreamState::Opening && entry.stream.can_send() {
                        entry.stream.mark_open();
                        let seq = entry.stream.next_send_seq();
                        self.send_queue
                            .push(Frame::opened(stream_id.to_wire(), seq));
                    }
                }
            }
            StreamCommand::Send { stream_id, data } => self.send_data(stream_id, data),
            StreamCommand::Close { stream_id } => self.close_stream_local(stream_id),
            StreamCommand::Reset { stream_id } => {
                if let Some(entry) = self.streams.remove(&stream_id) {
                    debug!("Stream {} aborted locally", stream_id);
                    self.abort(stream_id, entry);
                }
            }
        }
    }

    fn send_data(&mut self, stream_id: StreamId, data: Bytes) {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            trace!("Dropping send for unknown stream {}", stream_id);
            return;
        };
        if !entry.stream.can_send() {
            trace!("Dropping send for closing stream {}", stream_id);
            return;
        }

        let wire_id = stream_id.to_wire();
        entry.stream.touch();

        if entry.stream.protocol() == Protocol::Udp {
            if data.len() > super::MAX_PAYLOAD_SIZE {
                warn!("Dropping {} byte datagram on stream {}", data.len(), stream_id);
                return;
            }
            let seq = entry.stream.next_send_seq();
            self.send_queue.push(Frame::datagram(wire_id, seq, data));
            return;
        }

        let mut data = data;
        while !data.is_empty() {
            let chunk = data.split_to(data.len().min(super::MAX_PAYLOAD_SIZE));
            let seq = entry.stream.next_send_seq();
            self.send_queue.push(Frame::data(wire_id, seq, chunk));
        }
    }

    /// Close a stream locally
    /// Marks the local side as closed and queues a CLOSE frame.
    /// If both sides are closed, removes the stream from the map.
    pub fn close_stream_local(&mut self, stream_id: StreamId) {
        let Some(entry) = self.streams.get_mut(&stream_id) else {
            return;
        };

        if entry.stream.protocol() == Protocol::Udp {
            // UDP streams have no close handshake
            self.streams.remove(&stream_id);
            return;
        }

        if entry.stream.can_send() {
            let seq = entry.stream.next_send_seq();
            entry.stream.close_local();
            self.send_queue
                .push(Frame::close(stream_id.to_wire(), seq, false));
        }

        if entry.stream.is_closed() {
            debug!("Stream {} closed", stream_id);
            self.streams.remove(&stream_id);
        }
    }

    /// Drop UDP streams that have been idle too long
    pub fn sweep(&mut self, now: Instant) -> usize {
        let timeout = self.udp_idle_timeout;
        let expired: Vec<StreamId> = self
            .streams
            .iter()
            .filter(|(_, entry)| {
                entry.stream.protocol() == Protocol::Udp && entry.stream.idle_for(now) >= timeout
            })
            .map(|(&id, _)| id)
            .collect();

        for stream_id in &expired {
            if let Some(mut entry) = self.streams.remove(stream_id) {
                trace!("Removing idle UDP stream {}", stream_id);
                entry.stream.force_close();
                entry.notify(StreamEvent::Reset);
            }
        }
        expired.len()
    }

    /// Force every stream to Closed, e.g. after a channel timeout
    pub fn reset_all(&mut self) -> usize {
        let count = self.streams.len();
        let streams: Vec<(StreamId, StreamEntry)> = self.streams.drain().collect();
        for (stream_id, entry) in streams {
            self.abort(stream_id, entry);
        }
        self.udp_routes.clear();
        count
    }

    /// Get frames ready to send
    pub fn take_send_queue(&mut self) -> Vec<Frame> {
        std::mem::take(&mut self.send_queue)
    }

    /// Check if there are frames to send
    pub fn has_pending_frames(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// Get number of active streams
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// State of a stream, if it is still in the table
    pub fn stream_state(&self, stream_id: StreamId) -> Option<StreamState> {
        self.streams.get(&stream_id).map(|entry| entry.stream.state())
    }
}
