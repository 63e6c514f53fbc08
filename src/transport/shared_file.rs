//! Shared file channel
//!
//! Runs two background tasks: a poll loop that reads the peer's file and
//! delivers [`ChannelEvent`]s, and a flush loop that writes the outbound
//! buffer to our file.

use super::{new_epoch, ChannelCursor, ChannelEvent, Outbound, ReadBatch, TransportError, WriteOp};
use crate::protocol::FLUSH_THRESHOLD;
use crate::tunnel::{Frame, FrameType, StreamId};
use ring::rand::SystemRandom;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Capacity of the event queue towards the session
const EVENT_QUEUE_SIZE: usize = 1024;

/// Channel parameters
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    /// File the peer writes
    pub read_from: PathBuf,
    /// File this instance writes
    pub write_to: PathBuf,
    /// Write file size that triggers a purge
    pub purge_size: u64,
    /// Silence on the read file before the channel is considered down
    pub tunnel_timeout: Duration,
    /// Poll and flush interval
    pub read_duration: Duration,
    /// Parse a private copy of the read file
    pub isolated_reads: bool,
}

/// Bidirectional channel over a pair of files
pub struct SharedFileChannel {
    outbound: Arc<Mutex<Outbound>>,
    flush_now: Arc<Notify>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    snapshot: Option<PathBuf>,
}

impl SharedFileChannel {
    /// Start a new session on the write file and begin polling the read file.
    /// The loops run until [`SharedFileChannel::shutdown`].
    pub async fn open(
        settings: ChannelSettings,
    ) -> Result<(Self, mpsc::Receiver<ChannelEvent>), TransportError> {
        let epoch = new_epoch(&SystemRandom::new())?;
        let mut outbound = Outbound::new(epoch, settings.purge_size, settings.tunnel_timeout);

        // The header must be in place before the peer can see us
        let mut writer = FileWriter::new(settings.write_to.clone());
        let now = Instant::now();
        if let Some(op) = outbound.next_write(now) {
            writer.apply(&op).await?;
            outbound.commit(&op, now);
        }
        info!(
            "Writing to {} (epoch {:016x})",
            settings.write_to.display(),
            epoch
        );

        let snapshot = settings
            .isolated_reads
            .then(|| std::env::temp_dir().join(format!("ft-{:016x}.snapshot", epoch)));
        if let Some(snapshot) = &snapshot {
            debug!("Isolated reads through {}", snapshot.display());
        }
        info!("Reading from {}", settings.read_from.display());

        let cancel = CancellationToken::new();
        let outbound = Arc::new(Mutex::new(outbound));
        let flush_now = Arc::new(Notify::new());
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_SIZE);

        let poller = PollLoop {
            cursor: ChannelCursor::new(settings.read_from.clone(), snapshot.clone()),
            outbound: outbound.clone(),
            flush_now: flush_now.clone(),
            events: event_tx,
            tunnel_timeout: settings.tunnel_timeout,
            timed_out: false,
        };
        let flusher = FlushLoop {
            outbound: outbound.clone(),
            writer,
            flush_now: flush_now.clone(),
        };

        let tasks = vec![
            tokio::spawn(poller.run(settings.read_duration, cancel.clone())),
            tokio::spawn(flusher.run(settings.read_duration, cancel.clone())),
        ];

        Ok((
            Self {
                outbound,
                flush_now,
                cancel,
                tasks,
                snapshot,
            },
            event_rx,
        ))
    }

    /// Queue a frame for the write file
    pub async fn write(&self, frame: &Frame) {
        self.write_all(std::slice::from_ref(frame)).await;
    }

    /// Queue frames for the write file, keeping their order
    pub async fn write_all(&self, frames: &[Frame]) {
        if frames.is_empty() {
            return;
        }
        let mut outbound = self.outbound.lock().await;
        for frame in frames {
            outbound.push(frame);
        }
        if outbound.buffered() >= FLUSH_THRESHOLD {
            self.flush_now.notify_one();
        }
    }

    /// Epoch of the write file
    pub async fn epoch(&self) -> u64 {
        self.outbound.lock().await.epoch()
    }

    /// Stop both loops after a final flush
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Channel task failed: {}", e);
            }
        }
        if let Some(snapshot) = self.snapshot {
            let _ = tokio::fs::remove_file(snapshot).await;
        }
        debug!("Channel closed");
    }
}

/// Owner of the write file handle
struct FileWriter {
    path: PathBuf,
    file: Option<File>,
}

impl FileWriter {
    fn new(path: PathBuf) -> Self {
        Self { path, file: None }
    }

    /// Perform a write. The handle is reopened after any failure.
    async fn apply(&mut self, op: &WriteOp) -> io::Result<()> {
        let result = self.try_apply(op).await;
        if result.is_err() {
            self.file = None;
        }
        result
    }

    async fn try_apply(&mut self, op: &WriteOp) -> io::Result<()> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?
            }
        };
        let file = self.file.insert(file);

        match op {
            WriteOp::Reset { preamble, data } => {
                file.set_len(0).await?;
                file.write_all(preamble).await?;
                file.write_all(data).await?;
            }
            WriteOp::Append(data) => file.write_all(data).await?,
        }
        file.flush().await
    }
}

struct FlushLoop {
    outbound: Arc<Mutex<Outbound>>,
    writer: FileWriter,
    flush_now: Arc<Notify>,
}

impl FlushLoop {
    async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.flush_now.notified() => {}
                _ = cancel.cancelled() => break,
            }
            self.flush().await;
        }

        // Best effort, the peer may be gone already
        self.flush().await;
        debug!("Flush loop stopped");
    }

    /// Write everything that is ready. A failed write is retried next tick.
    async fn flush(&mut self) {
        loop {
            let Some(op) = self.outbound.lock().await.next_write(Instant::now()) else {
                return;
            };
            match self.writer.apply(&op).await {
                Ok(()) => {
                    trace!("Wrote {} bytes", op.len());
                    self.outbound.lock().await.commit(&op, Instant::now());
                }
                Err(e) => {
                    debug!("Write to {} failed: {}", self.writer.path.display(), e);
                    self.outbound.lock().await.restore(op);
                    return;
                }
            }
        }
    }
}

struct PollLoop {
    cursor: ChannelCursor,
    outbound: Arc<Mutex<Outbound>>,
    flush_now: Arc<Notify>,
    events: mpsc::Sender<ChannelEvent>,
    tunnel_timeout: Duration,
    timed_out: bool,
}

impl PollLoop {
    async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => break,
            }

            let batch = match self.cursor.poll().await {
                Ok(batch) => batch,
                Err(e) => {
                    debug!("Read failed: {}", e);
                    ReadBatch::default()
                }
            };

            if self.dispatch(batch).await.is_err() {
                break;
            }
        }
        debug!("Poll loop stopped");
    }

    async fn emit(&self, event: ChannelEvent) -> Result<(), TransportError> {
        self.events
            .send(event)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn dispatch(&mut self, batch: ReadBatch) -> Result<(), TransportError> {
        if let Some(restarted) = batch.peer_session {
            self.emit(ChannelEvent::PeerSession { restarted }).await?;
        }

        if batch.observed && self.timed_out {
            info!("Channel resumed");
            self.timed_out = false;
            self.emit(ChannelEvent::Resumed).await?;
        }

        let mut replies = Vec::new();
        let mut purge_requested = false;
        for frame in batch.frames {
            match frame.frame_type {
                FrameType::Ping => {}
                FrameType::Purge => purge_requested = true,
                FrameType::PurgeAck => match frame.purge_ack_position() {
                    Ok((epoch, offset)) => {
                        self.outbound.lock().await.ack_received(epoch, offset)
                    }
                    Err(e) => debug!("Ignoring purge ack: {}", e),
                },
                _ => self.emit(ChannelEvent::Frame(frame)).await?,
            }
        }

        for wire in batch.stale_opens {
            if let Some(stream_id) = StreamId::from_wire(wire) {
                debug!("Rejecting stream {} opened before this session", stream_id);
                replies.push(Frame::close(stream_id.to_wire(), 0, true));
            }
        }

        if purge_requested {
            if let Some(epoch) = self.cursor.epoch() {
                trace!("Acknowledging purge at offset {}", self.cursor.offset());
                replies.push(Frame::purge_ack(epoch, self.cursor.offset()));
            }
        }

        if !replies.is_empty() {
            let mut outbound = self.outbound.lock().await;
            for frame in &replies {
                outbound.push(frame);
            }
            drop(outbound);
            self.flush_now.notify_one();
        }

        let silent = self.cursor.silent_for(Instant::now());
        if !self.timed_out && silent > self.tunnel_timeout {
            warn!("No data from peer for {:?}", silent);
            self.timed_out = true;
            self.emit(ChannelEvent::TimedOut).await?;
        }
        Ok(())
    }
}
