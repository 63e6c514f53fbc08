//! Transport layer - the shared file channel
//!
//! Each instance appends frames to its write file and polls the file the
//! peer writes. Provides:
//! - Read cursor with purge and restart detection
//! - Buffered, coalescing writer with cooperative purge
//! - Liveness tracking and keepalive

mod cursor;
mod outbound;
mod shared_file;

pub use cursor::{ChannelCursor, ReadBatch};
pub use outbound::{Outbound, WriteOp};
pub use shared_file::{ChannelSettings, SharedFileChannel};

use crate::tunnel::Frame;
use ring::rand::{SecureRandom, SystemRandom};
use std::io;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),

    #[error("Random generation failed")]
    Random,

    #[error("Channel closed")]
    Closed,
}

/// Something observed on the read file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A frame for the multiplexer
    Frame(Frame),
    /// A peer instance started writing. `restarted` is set when it replaced
    /// a peer this instance already talked to.
    PeerSession { restarted: bool },
    /// Nothing arrived for longer than the tunnel timeout
    TimedOut,
    /// Data arrived again after a timeout
    Resumed,
}

/// Random starting epoch for a new write file
pub fn new_epoch(rng: &SystemRandom) -> Result<u64, TransportError> {
    let mut bytes = [0u8; 8];
    rng.fill(&mut bytes).map_err(|_| TransportError::Random)?;
    Ok(u64::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_epochs_differ() {
        let rng = SystemRandom::new();
        let a = new_epoch(&rng).unwrap();
        let b = new_epoch(&rng).unwrap();
        assert_ne!(a, b);
    }
}
