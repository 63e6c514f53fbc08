//! Read side of the channel

use super::TransportError;
use crate::protocol::{FileHeader, FILE_HEADER_SIZE};
use crate::tunnel::{Frame, FrameType};
use bytes::{Buf, BytesMut};
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::time::{Duration, Instant};
use tracing::{debug, info, trace};

const HEADER_END: u64 = FILE_HEADER_SIZE as u64;

/// What one poll of the read file produced
#[derive(Debug, Default)]
pub struct ReadBatch {
    /// Decoded frames, in file order
    pub frames: Vec<Frame>,
    /// Set when a peer session started; the flag tells whether it replaced
    /// a known one
    pub peer_session: Option<bool>,
    /// Wire ids of OPEN frames left over from before this instance started
    pub stale_opens: Vec<u32>,
    /// New bytes were consumed
    pub observed: bool,
}

/// Position of this instance in the file the peer writes
#[derive(Debug)]
pub struct ChannelCursor {
    path: PathBuf,
    /// Private copy parsed instead of `path` in isolated-read mode
    snapshot: Option<PathBuf>,
    offset: u64,
    epoch: Option<u64>,
    /// Frames ending at or before this offset predate this instance
    catch_up_until: u64,
    /// A poll has completed. A peer file first seen after that was started
    /// after this instance, so none of its content is stale.
    polled: bool,
    last_activity: Instant,
}

impl ChannelCursor {
    pub fn new(path: PathBuf, snapshot: Option<PathBuf>) -> Self {
        Self {
            path,
            snapshot,
            offset: HEADER_END,
            epoch: None,
            catch_up_until: 0,
            polled: false,
            last_activity: Instant::now(),
        }
    }

    /// Offset of the next undecoded byte
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Epoch of the file currently being read
    pub fn epoch(&self) -> Option<u64> {
        self.epoch
    }

    /// Time since new bytes were last consumed
    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Read whatever the peer appended since the last poll
    pub async fn poll(&mut self) -> Result<ReadBatch, TransportError> {
        let batch = self.read().await?;
        self.polled = true;
        Ok(batch)
    }

    async fn read(&mut self) -> Result<ReadBatch, TransportError> {
        let mut batch = ReadBatch::default();

        let source = match &self.snapshot {
            Some(snapshot) => match fs::copy(&self.path, snapshot).await {
                Ok(_) => snapshot.clone(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(batch),
                Err(e) => return Err(e.into()),
            },
            None => self.path.clone(),
        };

        let mut file = match File::open(&source).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(batch),
            Err(e) => return Err(e.into()),
        };

        let len = file.metadata().await?.len();
        if len < HEADER_END {
            // Truncated, header not written yet
            return Ok(batch);
        }

        let mut raw = [0u8; FILE_HEADER_SIZE];
        file.read_exact(&mut raw).await?;
        let Some(header) = FileHeader::decode(&raw)? else {
            return Ok(batch);
        };
        self.observe_header(header, len, &mut batch);

        if len <= self.offset {
            return Ok(batch);
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut data = Vec::with_capacity((len - self.offset) as usize);
        file.take(len - self.offset).read_to_end(&mut data).await?;

        // The peer may have purged while the delta was read. Isolated reads
        // check a fresh copy instead of the shared file.
        let check = match &self.snapshot {
            Some(snapshot) => match fs::copy(&self.path, snapshot).await {
                Ok(_) => snapshot,
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(batch),
                Err(e) => return Err(e.into()),
            },
            None => &self.path,
        };
        if read_epoch(check).await? != Some(header.epoch) {
            debug!("Peer file changed during read, discarding {} bytes", data.len());
            return Ok(batch);
        }

        self.decode(BytesMut::from(&data[..]), &mut batch);
        Ok(batch)
    }

    fn observe_header(&mut self, header: FileHeader, len: u64, batch: &mut ReadBatch) {
        match self.epoch {
            None => {
                info!("Peer session {:016x} found", header.epoch);
                self.epoch = Some(header.epoch);
                self.offset = HEADER_END;
                self.catch_up_until = if self.polled { 0 } else { len };
                self.last_activity = Instant::now();
                batch.peer_session = Some(false);
                batch.observed = true;
            }
            Some(epoch) if epoch == header.epoch => {
                if len < self.offset {
                    debug!("Read file shrank below cursor, rebasing");
                    self.offset = HEADER_END;
                }
            }
            Some(epoch) if header.is_successor_of(&FileHeader::new(epoch)) => {
                debug!("Peer purged its file (epoch {:016x})", header.epoch);
                self.epoch = Some(header.epoch);
                self.offset = HEADER_END;
                self.catch_up_until = 0;
            }
            Some(_) => {
                info!("Peer restarted (epoch {:016x})", header.epoch);
                self.epoch = Some(header.epoch);
                self.offset = HEADER_END;
                self.catch_up_until = 0;
                self.last_activity = Instant::now();
                batch.peer_session = Some(true);
                batch.observed = true;
            }
        }
    }

    fn decode(&mut self, mut buf: BytesMut, batch: &mut ReadBatch) {
        let total = buf.len();
        loop {
            match Frame::decode(&mut buf) {
                Ok(Some(frame)) => {
                    let end = self.offset + (total - buf.len()) as u64;
                    self.accept(frame, end, batch);
                }
                Ok(None) => break,
                Err(e) => {
                    if Frame::is_unwritten(&buf) {
                        trace!("{} unwritten bytes at end of read file", buf.len());
                        break;
                    }
                    match Frame::resync(&buf) {
                        Some(skip) => {
                            debug!("Skipping {} misaligned bytes: {}", skip, e);
                            buf.advance(skip);
                        }
                        None => {
                            debug!("Discarding {} misaligned bytes: {}", buf.len(), e);
                            buf.clear();
                        }
                    }
                }
            }
        }

        let consumed = total - buf.len();
        if consumed > 0 {
            self.offset += consumed as u64;
            self.last_activity = Instant::now();
            batch.observed = true;
        }
    }

    fn accept(&self, frame: Frame, end: u64, batch: &mut ReadBatch) {
        if end > self.catch_up_until {
            batch.frames.push(frame);
            return;
        }

        // Written before this instance started: only idempotent requests
        // are honoured
        match frame.frame_type {
            FrameType::Listen | FrameType::Purge => batch.frames.push(frame),
            FrameType::Open => batch.stale_opens.push(frame.stream_id),
            _ => trace!("Skipping stale {:?} frame", frame.frame_type),
        }
    }
}

/// Epoch in the header of `path`, if it has one
async fn read_epoch(path: &Path) -> Result<Option<u64>, TransportError> {
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut raw = [0u8; FILE_HEADER_SIZE];
    match file.read_exact(&mut raw).await {
        Ok(_) => Ok(FileHeader::decode(&raw)?.map(|header| header.epoch)),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}
