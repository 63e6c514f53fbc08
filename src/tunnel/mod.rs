//! Tunnel layer - streams multiplexed over the channel
//!
//! Provides:
//! - Frame encoding/decoding
//! - Stream multiplexing
//! - Listeners on the forwarding side (local)
//! - Target connections on the far side (remote)

mod frame;
mod local;
mod multiplexer;
mod relay;
mod remote;
mod stream;

pub use frame::{Frame, FrameType, FLAG_DATAGRAM, FLAG_RESET, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use local::LocalToRemoteTunnel;
pub use multiplexer::{
    Incoming, Multiplexer, StreamCommand, StreamEvent, StreamHandle, StreamWriter, TunnelHandle,
};
pub use remote::RemoteToLocalTunnel;
pub use stream::{Origin, StreamId, StreamState, TunnelStream};

use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Sequence gap: expected {expected}, got {actual}")]
    SequenceGap { expected: u32, actual: u32 },

    #[error("Too many streams (limit {0})")]
    TooManyStreams(usize),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Maximum number of concurrent streams
pub const MAX_STREAMS: usize = 4096;

/// Capacity of the stream command queue
pub const COMMAND_QUEUE_SIZE: usize = 256;
