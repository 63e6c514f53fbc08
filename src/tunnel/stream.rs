//! Multiplexed stream state

use super::TunnelError;
use crate::protocol::Protocol;
use std::fmt;
use tokio::time::{Duration, Instant};

/// Which side of the channel opened a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Opened by this instance
    Local,
    /// Opened by the peer
    Remote,
}

/// Stream identifier, unique per origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub origin: Origin,
    pub number: u32,
}

impl StreamId {
    /// Wire bit set when the sender of a frame opened the stream
    pub const INITIATOR_BIT: u32 = 0x8000_0000;

    /// Largest stream number
    pub const MAX_NUMBER: u32 = Self::INITIATOR_BIT - 1;

    pub fn local(number: u32) -> Self {
        Self {
            origin: Origin::Local,
            number,
        }
    }

    pub fn remote(number: u32) -> Self {
        Self {
            origin: Origin::Remote,
            number,
        }
    }

    /// Wire ID for a frame sent by this instance
    pub fn to_wire(self) -> u32 {
        match self.origin {
            Origin::Local => self.number | Self::INITIATOR_BIT,
            Origin::Remote => self.number,
        }
    }

    /// Stream ID of a frame sent by the peer. `None` for control frames.
    pub fn from_wire(wire: u32) -> Option<Self> {
        let number = wire & Self::MAX_NUMBER;
        if number == 0 {
            return None;
        }
        if wire & Self::INITIATOR_BIT != 0 {
            Some(Self::remote(number))
        } else {
            Some(Self::local(number))
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.origin {
            Origin::Local => write!(f, "L{}", self.number),
            Origin::Remote => write!(f, "R{}", self.number),
        }
    }
}

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// OPEN exchanged, target socket not yet confirmed
    Opening,
    /// Relaying in both directions
    Open,
    /// One side has sent CLOSE, in-flight frames still drain
    Closing,
    /// Stream is fully closed
    Closed,
}

/// A multiplexed stream within the channel
#[derive(Debug)]
pub struct TunnelStream {
    /// Stream ID
    id: StreamId,
    /// TCP or UDP
    protocol: Protocol,
    /// Current state
    state: StreamState,
    /// Target endpoint the remote side connects to
    target: String,
    /// Next sequence number to send
    send_seq: u32,
    /// Next sequence number expected from the peer
    recv_seq: u32,
    /// CLOSE sent
    local_closed: bool,
    /// CLOSE received
    remote_closed: bool,
    last_activity: Instant,
}

impl TunnelStream {
    /// Create a stream opened by this instance
    pub fn new(id: StreamId, protocol: Protocol, target: String) -> Self {
        Self {
            id,
            protocol,
            state: StreamState::Opening,
            target,
            send_seq: 0,
            recv_seq: 0,
            local_closed: false,
            remote_closed: false,
            last_activity: Instant::now(),
        }
    }

    /// Create a stream opened by the peer, whose first frame carried `first_seq`
    pub fn accepted(id: StreamId, protocol: Protocol, target: String, first_seq: u32) -> Self {
        let mut stream = Self::new(id, protocol, target);
        stream.recv_seq = first_seq.wrapping_add(1);
        stream
    }

    /// Get stream ID
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Get current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Take the sequence number for the next outgoing frame
    pub fn next_send_seq(&mut self) -> u32 {
        let seq = self.send_seq;
        self.send_seq = seq.wrapping_add(1);
        seq
    }

    /// Check the sequence number of an incoming frame. Datagram streams
    /// resynchronise on a gap instead of failing.
    pub fn accept_seq(&mut self, seq: u32) -> Result<(), TunnelError> {
        if seq != self.recv_seq && self.protocol == Protocol::Tcp {
            return Err(TunnelError::SequenceGap {
                expected: self.recv_seq,
                actual: seq,
            });
        }
        self.recv_seq = seq.wrapping_add(1);
        self.touch();
        Ok(())
    }

    /// Target socket confirmed
    pub fn mark_open(&mut self) {
        if self.state == StreamState::Opening {
            self.state = StreamState::Open;
        }
    }

    /// Check if stream can send data
    pub fn can_send(&self) -> bool {
        !self.local_closed && self.state != StreamState::Closed
    }

    /// Check if stream can receive data
    pub fn can_recv(&self) -> bool {
        !self.remote_closed && self.state != StreamState::Closed
    }

    /// Close local side
    pub fn close_local(&mut self) {
        self.local_closed = true;
        self.update_state();
    }

    /// Close remote side
    pub fn close_remote(&mut self) {
        self.remote_closed = true;
        self.update_state();
    }

    /// Skip the close handshake
    pub fn force_close(&mut self) {
        self.local_closed = true;
        self.remote_closed = true;
        self.state = StreamState::Closed;
    }

    fn update_state(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.state = match (self.local_closed, self.remote_closed) {
            (true, true) => StreamState::Closed,
            (false, false) => self.state,
            _ => StreamState::Closing,
        };
    }

    /// Check if stream is fully closed
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Time since the last frame was sent or received
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_ids_are_relative_to_sender() {
        let mine = StreamId::local(5);
        // The peer sees our stream as remote-originated
        assert_eq!(StreamId::from_wire(mine.to_wire()), Some(StreamId::remote(5)));

        let theirs = StreamId::remote(5);
        assert_eq!(StreamId::from_wire(theirs.to_wire()), Some(StreamId::local(5)));

        assert_ne!(mine.to_wire(), theirs.to_wire());
        assert_eq!(StreamId::from_wire(0), None);
        assert_eq!(StreamId::from_wire(StreamId::INITIATOR_BIT), None);
    }

    #[test]
    fn test_stream_states() {
        let mut stream = TunnelStream::new(StreamId::local(1), Protocol::Tcp, "t:1".into());
        assert_eq!(stream.state(), StreamState::Opening);

        stream.mark_open();
        assert_eq!(stream.state(), StreamState::Open);

        stream.close_local();
        assert_eq!(stream.state(), StreamState::Closing);
        assert!(!stream.can_send());
        assert!(stream.can_recv());

        stream.close_remote();
        assert_eq!(stream.state(), StreamState::Closed);
        assert!(stream.is_closed());
    }

    #[test]
    fn test_close_while_opening() {
        let mut stream = TunnelStream::new(StreamId::local(1), Protocol::Tcp, "t:1".into());
        stream.close_remote();
        assert_eq!(stream.state(), StreamState::Closing);

        stream.mark_open();
        assert_eq!(stream.state(), StreamState::Closing);
    }

    #[test]
    fn test_sequence_checks() {
        let mut stream =
            TunnelStream::accepted(StreamId::remote(3), Protocol::Tcp, "t:1".into(), 0);

        assert!(stream.accept_seq(1).is_ok());
        assert!(stream.accept_seq(2).is_ok());
        assert!(matches!(
            stream.accept_seq(4),
            Err(TunnelError::SequenceGap { expected: 3, actual: 4 })
        ));

        assert_eq!(stream.next_send_seq(), 0);
        assert_eq!(stream.next_send_seq(), 1);
    }

    #[test]
    fn test_datagram_gap_resynchronises() {
        let mut stream =
            TunnelStream::accepted(StreamId::remote(3), Protocol::Udp, "t:53".into(), 0);

        assert!(stream.accept_seq(5).is_ok());
        assert!(stream.accept_seq(6).is_ok());
    }

    #[test]
    fn test_force_close() {
        let mut stream = TunnelStream::new(StreamId::local(1), Protocol::Udp, "t:1".into());
        stream.force_close();
        assert!(stream.is_closed());
        assert!(!stream.can_send());
        assert!(!stream.can_recv());
    }
}
