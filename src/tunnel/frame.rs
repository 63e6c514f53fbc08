//! Frame encoding/decoding for the channel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |   Magic (2B)    |  Type  | Flags  |
//! +--------+--------+--------+--------+
//! |           Stream ID (4B)          |
//! +--------+--------+--------+--------+
//! |           Sequence (4B)           |
//! +--------+--------+--------+--------+
//! |   Length (2B)   |     Payload     |
//! +--------+--------+--------+--------+
//! ```
//!
//! The high bit of the stream ID is set when the stream was opened by the
//! sender of the frame. Control frames use stream ID 0.

use super::TunnelError;
use crate::protocol::Protocol;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 14;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Marker at the start of every frame
pub const FRAME_MAGIC: [u8; 2] = [0xF7, 0x7E];

/// Frame belongs to a UDP stream
pub const FLAG_DATAGRAM: u8 = 0x01;

/// CLOSE is abortive
pub const FLAG_RESET: u8 = 0x02;

const KNOWN_FLAGS: u8 = FLAG_DATAGRAM | FLAG_RESET;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Stream open request
    Open = 0x01,
    /// Data frame
    Data = 0x02,
    /// Stream close
    Close = 0x03,
    /// Target socket connected
    Opened = 0x04,
    /// Ask the peer to start a listener
    Listen = 0x05,
    /// Keepalive
    Ping = 0x10,
    /// Writer is about to truncate its file
    Purge = 0x11,
    /// Reader consumed everything up to a purge
    PurgeAck = 0x12,
}

impl FrameType {
    /// Whether frames of this type address a stream
    pub fn is_stream_frame(self) -> bool {
        matches!(
            self,
            FrameType::Open | FrameType::Data | FrameType::Close | FrameType::Opened
        )
    }
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::Open),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::Close),
            0x04 => Ok(FrameType::Opened),
            0x05 => Ok(FrameType::Listen),
            0x10 => Ok(FrameType::Ping),
            0x11 => Ok(FrameType::Purge),
            0x12 => Ok(FrameType::PurgeAck),
            _ => Err(TunnelError::InvalidFrame(format!(
                "Unknown frame type: {}",
                value
            ))),
        }
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Flag bits
    pub flags: u8,
    /// Stream ID as written on the wire (0 for control frames)
    pub stream_id: u32,
    /// Per-stream sequence number
    pub sequence: u32,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    fn new(frame_type: FrameType, stream_id: u32, sequence: u32, payload: Bytes) -> Self {
        Self {
            frame_type,
            flags: 0,
            stream_id,
            sequence,
            payload,
        }
    }

    fn control(frame_type: FrameType, payload: Bytes) -> Self {
        Self::new(frame_type, 0, 0, payload)
    }

    /// Create a stream open frame
    pub fn open(stream_id: u32, sequence: u32, protocol: Protocol, target: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + target.len());
        payload.put_u8(protocol.to_byte());
        payload.put_slice(target.as_bytes());
        let mut frame = Self::new(FrameType::Open, stream_id, sequence, payload.freeze());
        if protocol == Protocol::Udp {
            frame.flags |= FLAG_DATAGRAM;
        }
        frame
    }

    /// Create an open confirmation frame
    pub fn opened(stream_id: u32, sequence: u32) -> Self {
        Self::new(FrameType::Opened, stream_id, sequence, Bytes::new())
    }

    /// Create a new data frame
    pub fn data(stream_id: u32, sequence: u32, payload: Bytes) -> Self {
        Self::new(FrameType::Data, stream_id, sequence, payload)
    }

    /// Create a data frame carrying exactly one UDP datagram
    pub fn datagram(stream_id: u32, sequence: u32, payload: Bytes) -> Self {
        let mut frame = Self::data(stream_id, sequence, payload);
        frame.flags |= FLAG_DATAGRAM;
        frame
    }

    /// Create a stream close frame
    pub fn close(stream_id: u32, sequence: u32, reset: bool) -> Self {
        let mut frame = Self::new(FrameType::Close, stream_id, sequence, Bytes::new());
        if reset {
            frame.flags |= FLAG_RESET;
        }
        frame
    }

    /// Create a listener request frame
    pub fn listen(protocol: Protocol, listen: &str, target: &str) -> Self {
        let mut payload = BytesMut::with_capacity(3 + listen.len() + target.len());
        payload.put_u8(protocol.to_byte());
        payload.put_u16(listen.len() as u16);
        payload.put_slice(listen.as_bytes());
        payload.put_slice(target.as_bytes());
        Self::control(FrameType::Listen, payload.freeze())
    }

    /// Create a keepalive frame
    pub fn ping() -> Self {
        Self::control(FrameType::Ping, Bytes::new())
    }

    /// Create a purge announcement frame
    pub fn purge() -> Self {
        Self::control(FrameType::Purge, Bytes::new())
    }

    /// Create a purge acknowledgement frame
    pub fn purge_ack(epoch: u64, offset: u64) -> Self {
        let mut payload = BytesMut::with_capacity(16);
        payload.put_u64(epoch);
        payload.put_u64(offset);
        Self::control(FrameType::PurgeAck, payload.freeze())
    }

    /// Whether the datagram flag is set
    pub fn is_datagram(&self) -> bool {
        self.flags & FLAG_DATAGRAM != 0
    }

    /// Whether the reset flag is set
    pub fn is_reset(&self) -> bool {
        self.flags & FLAG_RESET != 0
    }

    /// Parse the payload of an OPEN frame
    pub fn open_target(&self) -> Result<(Protocol, String), TunnelError> {
        if self.payload.is_empty() {
            return Err(TunnelError::InvalidFrame("Empty open payload".to_string()));
        }
        let protocol = Protocol::from_byte(self.payload[0])?;
        let target = std::str::from_utf8(&self.payload[1..])
            .map_err(|_| TunnelError::InvalidFrame("Target is not UTF-8".to_string()))?;
        if target.is_empty() {
            return Err(TunnelError::InvalidFrame("Empty target".to_string()));
        }
        Ok((protocol, target.to_string()))
    }

    /// Parse the payload of a LISTEN frame into (protocol, listen, target)
    pub fn listen_rule(&self) -> Result<(Protocol, String, String), TunnelError> {
        let mut payload = &self.payload[..];
        if payload.len() < 3 {
            return Err(TunnelError::InvalidFrame("Short listen payload".to_string()));
        }
        let protocol = Protocol::from_byte(payload.get_u8())?;
        let listen_len = payload.get_u16() as usize;
        if payload.len() < listen_len {
            return Err(TunnelError::InvalidFrame("Short listen payload".to_string()));
        }
        let (listen, target) = payload.split_at(listen_len);
        let listen = std::str::from_utf8(listen)
            .map_err(|_| TunnelError::InvalidFrame("Listen endpoint is not UTF-8".to_string()))?;
        let target = std::str::from_utf8(target)
            .map_err(|_| TunnelError::InvalidFrame("Target is not UTF-8".to_string()))?;
        Ok((protocol, listen.to_string(), target.to_string()))
    }

    /// Parse the payload of a PURGE_ACK frame into (epoch, offset)
    pub fn purge_ack_position(&self) -> Result<(u64, u64), TunnelError> {
        if self.payload.len() != 16 {
            return Err(TunnelError::InvalidFrame("Invalid purge ack".to_string()));
        }
        let mut payload = &self.payload[..];
        Ok((payload.get_u64(), payload.get_u64()))
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(self.encoded_size());
        self.encode_into(&mut buf);
        buf
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        debug_assert!(self.payload.len() <= MAX_PAYLOAD_SIZE);

        buf.reserve(self.encoded_size());
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags);
        buf.put_u32(self.stream_id);
        buf.put_u32(self.sequence);
        buf.put_u16(self.payload.len() as u16);
        buf.extend_from_slice(&self.payload);
    }

    /// Decode frame from bytes
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when it holds only part
    /// of a frame. Returns an error without consuming anything when the bytes
    /// at the front are not a frame header.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, TunnelError> {
        let payload_len = match Self::check_header(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };

        if buf.len() < FRAME_HEADER_SIZE + payload_len {
            return Ok(None);
        }

        buf.advance(2);
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let flags = buf.get_u8();
        let stream_id = buf.get_u32();
        let sequence = buf.get_u32();
        buf.advance(2);
        let payload = buf.split_to(payload_len).freeze();

        Ok(Some(Self {
            frame_type,
            flags,
            stream_id,
            sequence,
            payload,
        }))
    }

    /// Validate the header at the front of `buf` and return the payload length
    fn check_header(buf: &[u8]) -> Result<Option<usize>, TunnelError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        if buf[..2] != FRAME_MAGIC {
            return Err(TunnelError::InvalidFrame("Bad frame magic".to_string()));
        }
        if buf.len() < FRAME_HEADER_SIZE {
            // Type and flags are checked as soon as they are present
            if buf.len() > 2 {
                FrameType::try_from(buf[2])?;
            }
            if buf.len() > 3 && buf[3] & !KNOWN_FLAGS != 0 {
                return Err(TunnelError::InvalidFrame(format!("Unknown flags: {}", buf[3])));
            }
            return Ok(None);
        }

        let frame_type = FrameType::try_from(buf[2])?;
        if buf[3] & !KNOWN_FLAGS != 0 {
            return Err(TunnelError::InvalidFrame(format!("Unknown flags: {}", buf[3])));
        }
        let stream_id = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if frame_type.is_stream_frame() == (stream_id == 0) {
            return Err(TunnelError::InvalidFrame(format!(
                "Stream id {} not valid for {:?}",
                stream_id, frame_type
            )));
        }
        Ok(Some(u16::from_be_bytes([buf[12], buf[13]]) as usize))
    }

    /// Find the next position in `buf` (after index 0) where a frame header
    /// could start. Used to skip garbage after a misaligned read.
    ///
    /// Returns `None` when no candidate exists; the caller may then discard
    /// everything except a possible partial magic at the very end.
    pub fn resync(buf: &[u8]) -> Option<usize> {
        (1..buf.len()).find(|&pos| {
            let rest = &buf[pos..];
            if rest.len() < 2 {
                return rest[0] == FRAME_MAGIC[0];
            }
            Self::check_header(rest).is_ok()
        })
    }

    /// Whether `buf` consists only of zero bytes. Some shared storage
    /// backends expose a file's new length before its content.
    pub fn is_unwritten(buf: &[u8]) -> bool {
        buf.iter().all(|&b| b == 0)
    }

    /// Get the total encoded size of this frame
    pub fn encoded_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}
