//! Protocol definitions and constants
//!
//! Channel file layout:
//! ```text
//! +--------+--------+--------+--------+
//! |          Magic "FTUN" (4B)        |
//! +--------+--------+--------+--------+
//! |  Version (2B)   |  Reserved (2B)  |
//! +--------+--------+--------+--------+
//! |            Epoch (8B)             |
//! |                                   |
//! +--------+--------+--------+--------+
//! |     Frames, appended in order     |
//! +--------+--------+--------+--------+
//! ```

use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u16, actual: u16 },

    #[error("Invalid protocol byte: {0}")]
    InvalidProtocol(u8),
}

/// Channel file format version
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the header at the start of every channel file
pub const FILE_HEADER_SIZE: usize = 16;

/// Default interval between polls of the read file
pub const DEFAULT_READ_DURATION: Duration = Duration::from_millis(10);

/// Default silence on the read file before all streams are closed
pub const DEFAULT_TUNNEL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default write file size that triggers a purge (10 MiB)
pub const DEFAULT_PURGE_SIZE: u64 = 10 * 1024 * 1024;

/// Default idle time after which a UDP stream is forgotten
pub const DEFAULT_UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default timeout for outbound TCP connects
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the keepalive interval
pub const MAX_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Outbound buffer size that triggers an early flush (256 KiB)
pub const FLUSH_THRESHOLD: usize = 256 * 1024;

/// Transport protocol of a forwarding rule or stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// Wire representation
    pub const fn to_byte(self) -> u8 {
        match self {
            Protocol::Tcp => 0,
            Protocol::Udp => 1,
        }
    }

    /// Parse from the wire representation
    pub fn from_byte(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0 => Ok(Protocol::Tcp),
            1 => Ok(Protocol::Udp),
            other => Err(ProtocolError::InvalidProtocol(other)),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Header written at offset zero of every channel file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Generation of the file content. Random on startup, +1 on every purge.
    pub epoch: u64,
}

impl FileHeader {
    pub fn new(epoch: u64) -> Self {
        Self { epoch }
    }

    /// Header of the file after the next purge
    pub fn next(&self) -> Self {
        Self {
            epoch: self.epoch.wrapping_add(1),
        }
    }

    /// Whether `other` is the header written by a purge of `self`
    pub fn is_successor_of(&self, other: &FileHeader) -> bool {
        self.epoch == other.epoch.wrapping_add(1)
    }

    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FILE_HEADER_SIZE);
        buf.put_slice(crate::MAGIC.as_slice());
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u16(0);
        buf.put_u64(self.epoch);
        buf
    }

    /// Decode a header. Returns `Ok(None)` when fewer than
    /// [`FILE_HEADER_SIZE`] bytes are available.
    pub fn decode(mut buf: &[u8]) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < FILE_HEADER_SIZE {
            return Ok(None);
        }
        if buf[..4] != crate::MAGIC {
            return Err(ProtocolError::InvalidMagic);
        }
        buf.advance(4);

        let version = buf.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: version,
            });
        }
        let _reserved = buf.get_u16();
        let epoch = buf.get_u64();

        Ok(Some(Self { epoch }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = FileHeader::new(0x0102_0304_0506_0708);
        let encoded = header.encode();

        assert_eq!(encoded.len(), FILE_HEADER_SIZE);
        assert_eq!(&encoded[..4], b"FTUN");
        assert_eq!(&encoded[4..6], &PROTOCOL_VERSION.to_be_bytes());
        assert_eq!(&encoded[8..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(FileHeader::decode(&encoded).unwrap(), Some(header));
    }

    #[test]
    fn test_short_header_is_incomplete() {
        let encoded = FileHeader::new(7).encode();
        assert_eq!(FileHeader::decode(&encoded[..10]).unwrap(), None);
    }

    #[test]
    fn test_header_rejects_foreign_file() {
        let result = FileHeader::decode(b"GET / HTTP/1.1\r\n\r\n");
        assert!(matches!(result, Err(ProtocolError::InvalidMagic)));
    }

    #[test]
    fn test_successor_wraps() {
        let last = FileHeader::new(u64::MAX);
        assert_eq!(last.next().epoch, 0);
        assert!(last.next().is_successor_of(&last));
        assert!(!last.is_successor_of(&last.next()));
    }

    #[test]
    fn test_protocol_byte() {
        assert_eq!(Protocol::from_byte(Protocol::Udp.to_byte()).unwrap(), Protocol::Udp);
        assert!(matches!(
            Protocol::from_byte(9),
            Err(ProtocolError::InvalidProtocol(9))
        ));
    }
}
