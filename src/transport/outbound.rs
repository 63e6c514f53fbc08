//! Write side of the channel
//!
//! Frames are encoded into memory and handed to the flush loop in large
//! chunks, so every filesystem append carries whole frames.

use crate::protocol::{FileHeader, MAX_KEEPALIVE_INTERVAL};
use crate::tunnel::{Frame, FrameType};
use bytes::{Bytes, BytesMut};
use tokio::time::{Duration, Instant};
use tracing::{debug, warn};

/// A pending filesystem operation on the write file
#[derive(Debug, PartialEq, Eq)]
pub enum WriteOp {
    /// Truncate the file, then write `preamble` followed by `data`
    Reset { preamble: Bytes, data: Bytes },
    /// Append to the file
    Append(Bytes),
}

impl WriteOp {
    pub fn len(&self) -> usize {
        match self {
            WriteOp::Reset { preamble, data } => preamble.len() + data.len(),
            WriteOp::Append(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug)]
enum PurgeState {
    Idle,
    /// PURGE queued; waiting for the peer to read up to `frame_end`
    Holding { frame_end: u64, since: Instant },
}

/// Outbound buffer and purge state of the write file
#[derive(Debug)]
pub struct Outbound {
    header: FileHeader,
    /// Encoded frames ready to be written
    buf: BytesMut,
    /// Frames produced while holding
    held: BytesMut,
    /// PURGE_ACKs written while holding, repeated after truncation
    acks: BytesMut,
    /// Current length of the write file
    written: u64,
    purge: PurgeState,
    reset_pending: bool,
    purge_size: u64,
    purge_timeout: Duration,
    keepalive_interval: Duration,
    last_write: Instant,
}

impl Outbound {
    /// Create the buffer for a new write file. The first operation it
    /// yields truncates the file and writes the header.
    pub fn new(epoch: u64, purge_size: u64, tunnel_timeout: Duration) -> Self {
        Self {
            header: FileHeader::new(epoch),
            buf: BytesMut::new(),
            held: BytesMut::new(),
            acks: BytesMut::new(),
            written: 0,
            purge: PurgeState::Idle,
            reset_pending: true,
            purge_size,
            purge_timeout: tunnel_timeout / 2,
            keepalive_interval: (tunnel_timeout / 4).min(MAX_KEEPALIVE_INTERVAL),
            last_write: Instant::now(),
        }
    }

    /// Epoch of the write file
    pub fn epoch(&self) -> u64 {
        self.header.epoch
    }

    /// Current length of the write file
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Bytes waiting for the next flush
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn is_holding(&self) -> bool {
        matches!(self.purge, PurgeState::Holding { .. })
    }

    /// Queue a frame
    pub fn push(&mut self, frame: &Frame) {
        match self.purge {
            PurgeState::Holding { .. } if frame.frame_type == FrameType::PurgeAck => {
                frame.encode_into(&mut self.acks);
                frame.encode_into(&mut self.buf);
            }
            PurgeState::Holding { .. } => frame.encode_into(&mut self.held),
            PurgeState::Idle => frame.encode_into(&mut self.buf),
        }
    }

    /// The peer has read our file up to `offset`
    pub fn ack_received(&mut self, epoch: u64, offset: u64) {
        let PurgeState::Holding { frame_end, .. } = self.purge else {
            return;
        };
        if self.reset_pending || epoch != self.header.epoch || offset < frame_end {
            return;
        }
        debug!("Purge acknowledged at offset {}", offset);
        self.begin_reset();
    }

    fn begin_reset(&mut self) {
        self.header = self.header.next();
        self.reset_pending = true;
    }

    /// Next operation the flush loop should perform
    pub fn next_write(&mut self, now: Instant) -> Option<WriteOp> {
        if let PurgeState::Holding { since, .. } = self.purge {
            if !self.reset_pending && now.saturating_duration_since(since) >= self.purge_timeout {
                warn!("Purge not acknowledged, truncating write file");
                self.begin_reset();
            }
        }

        if self.reset_pending {
            let mut preamble = self.header.encode();
            preamble.extend_from_slice(&self.acks);
            return Some(WriteOp::Reset {
                preamble: preamble.freeze(),
                data: self.buf.split().freeze(),
            });
        }

        if self.buf.is_empty()
            && !self.is_holding()
            && now.saturating_duration_since(self.last_write) >= self.keepalive_interval
        {
            Frame::ping().encode_into(&mut self.buf);
        }

        if self.buf.is_empty() {
            return None;
        }
        Some(WriteOp::Append(self.buf.split().freeze()))
    }

    /// Record a successful write
    pub fn commit(&mut self, op: &WriteOp, now: Instant) {
        self.last_write = now;
        match op {
            WriteOp::Reset { .. } => {
                if self.is_holding() {
                    debug!("Write file purged, epoch {:016x}", self.header.epoch);
                }
                self.written = op.len() as u64;
                self.reset_pending = false;
                self.purge = PurgeState::Idle;
                self.acks.clear();

                let mut pending = std::mem::take(&mut self.held);
                pending.extend_from_slice(&self.buf);
                self.buf = pending;
            }
            WriteOp::Append(data) => {
                self.written += data.len() as u64;
            }
        }

        if !self.is_holding() && self.written >= self.purge_size {
            self.start_purge(now);
        }
    }

    fn start_purge(&mut self, now: Instant) {
        Frame::purge().encode_into(&mut self.buf);
        let frame_end = self.written + self.buf.len() as u64;
        debug!("Write file at {} bytes, requesting purge", self.written);
        self.purge = PurgeState::Holding {
            frame_end,
            since: now,
        };
    }

    /// Put back the data of a failed write
    pub fn restore(&mut self, op: WriteOp) {
        let data = match op {
            WriteOp::Reset { data, .. } => data,
            WriteOp::Append(data) => data,
        };
        let mut pending = BytesMut::with_capacity(data.len() + self.buf.len());
        pending.extend_from_slice(&data);
        pending.extend_from_slice(&self.buf);
        self.buf = pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FILE_HEADER_SIZE;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn decode_all(bytes: &[u8]) -> Vec<Frame> {
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = Frame::decode(&mut buf).unwrap() {
            frames.push(frame);
        }
        assert!(buf.is_empty());
        frames
    }

    fn started(purge_size: u64) -> (Outbound, Instant) {
        let now = Instant::now();
        let mut out = Outbound::new(100, purge_size, TIMEOUT);
        let op = out.next_write(now).unwrap();
        assert!(matches!(op, WriteOp::Reset { .. }));
        out.commit(&op, now);
        (out, now)
    }

    fn data(seq: u32, len: usize) -> Frame {
        Frame::data(1, seq, Bytes::from(vec![0x42; len]))
    }

    #[test]
    fn test_startup_writes_header() {
        let mut out = Outbound::new(100, 1024, TIMEOUT);
        out.push(&data(0, 4));

        let op = out.next_write(Instant::now()).unwrap();
        let WriteOp::Reset { preamble, data: body } = &op else {
            panic!("expected reset");
        };
        assert_eq!(FileHeader::decode(preamble).unwrap(), Some(FileHeader::new(100)));
        assert_eq!(decode_all(body).len(), 1);

        out.commit(&op, Instant::now());
        assert_eq!(out.written(), (FILE_HEADER_SIZE + 18) as u64);
    }

    #[test]
    fn test_frames_are_coalesced() {
        let (mut out, now) = started(1 << 20);
        for seq in 0..3 {
            out.push(&data(seq, 10));
        }

        let Some(WriteOp::Append(bytes)) = out.next_write(now) else {
            panic!("expected append");
        };
        assert_eq!(decode_all(&bytes).len(), 3);
        assert!(out.next_write(now).is_none());
    }

    #[test]
    fn test_failed_write_is_retried_first() {
        let (mut out, now) = started(1 << 20);
        out.push(&data(0, 10));
        let op = out.next_write(now).unwrap();

        out.push(&data(1, 10));
        out.restore(op);

        let Some(WriteOp::Append(bytes)) = out.next_write(now) else {
            panic!("expected append");
        };
        let seqs: Vec<u32> = decode_all(&bytes).iter().map(|f| f.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
    }

    #[test]
    fn test_keepalive_when_idle() {
        let (mut out, now) = started(1 << 20);
        assert!(out.next_write(now).is_none());

        let Some(WriteOp::Append(bytes)) = out.next_write(now + Duration::from_secs(2)) else {
            panic!("expected keepalive");
        };
        assert_eq!(decode_all(&bytes)[0].frame_type, FrameType::Ping);
    }

    #[test]
    fn test_cooperative_purge() {
        let (mut out, now) = started(64);
        out.push(&data(0, 100));
        let op = out.next_write(now).unwrap();
        out.commit(&op, now);
        assert!(out.is_holding());

        // PURGE is the last frame before holding
        let op = out.next_write(now).unwrap();
        let WriteOp::Append(bytes) = &op else {
            panic!("expected append");
        };
        assert_eq!(decode_all(bytes)[0].frame_type, FrameType::Purge);
        out.commit(&op, now);
        let purge_end = out.written();

        // Data is held, acknowledgements are not
        out.push(&data(1, 10));
        assert!(out.next_write(now).is_none());
        out.push(&Frame::purge_ack(9, 77));
        let op = out.next_write(now).unwrap();
        out.commit(&op, now);

        out.ack_received(100, purge_end - 1);
        out.ack_received(99, purge_end);
        assert!(out.is_holding());
        assert!(out.next_write(now).is_none());

        out.ack_received(100, purge_end);
        let op = out.next_write(now).unwrap();
        let WriteOp::Reset { preamble, .. } = &op else {
            panic!("expected reset");
        };
        assert_eq!(
            FileHeader::decode(preamble).unwrap(),
            Some(FileHeader::new(101))
        );
        let resent = decode_all(&preamble[FILE_HEADER_SIZE..]);
        assert_eq!(resent, vec![Frame::purge_ack(9, 77)]);

        out.commit(&op, now);
        assert!(!out.is_holding());
        assert_eq!(out.epoch(), 101);

        let Some(WriteOp::Append(bytes)) = out.next_write(now) else {
            panic!("expected held data");
        };
        assert_eq!(decode_all(&bytes), vec![data(1, 10)]);
    }

    #[test]
    fn test_unilateral_purge() {
        let (mut out, now) = started(64);
        out.push(&data(0, 100));
        let op = out.next_write(now).unwrap();
        out.commit(&op, now);
        let op = out.next_write(now).unwrap();
        out.commit(&op, now);
        assert!(out.is_holding());

        let later = now + TIMEOUT / 2;
        let op = out.next_write(later).unwrap();
        assert!(matches!(op, WriteOp::Reset { .. }));
        out.commit(&op, later);
        assert_eq!(out.written(), FILE_HEADER_SIZE as u64);
        assert_eq!(out.epoch(), 101);
    }
}
