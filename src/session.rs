//! Tunnel session
//!
//! Wires the shared file channel, the multiplexer and both tunnel directions
//! together. The multiplexer is owned by a single driver task; everything
//! else talks to it through channels.

use crate::config::{ForwardRule, TunnelSettings};
use crate::protocol::Protocol;
use crate::transport::{ChannelEvent, SharedFileChannel};
use crate::tunnel::{
    Frame, Incoming, LocalToRemoteTunnel, Multiplexer, RemoteToLocalTunnel, StreamCommand,
};
use crate::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval of the UDP idle sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Commands handled per wakeup before frames are passed to the channel
const COMMAND_BATCH: usize = 64;

/// A running tunnel endpoint
pub struct Session {
    cancel: CancellationToken,
    local: Arc<LocalToRemoteTunnel>,
    driver: JoinHandle<()>,
}

impl Session {
    /// Open the channel, start the configured listeners and announce the
    /// remote forwards to the peer
    pub async fn start(settings: TunnelSettings, cancel: CancellationToken) -> Result<Self> {
        let cancel = cancel.child_token();
        let (channel, events) = SharedFileChannel::open(settings.channel.clone()).await?;

        let (mux, commands) = Multiplexer::new(settings.udp_idle_timeout);
        let local = Arc::new(LocalToRemoteTunnel::new(mux.handle(), cancel.clone()));
        for rule in &settings.forwards {
            if let Err(e) = local.add_listener(rule).await {
                cancel.cancel();
                channel.shutdown().await;
                return Err(e.into());
            }
        }

        let remote = RemoteToLocalTunnel::new(
            settings.udp_send_from,
            settings.connect_timeout,
            cancel.clone(),
        );

        let driver = Driver {
            channel,
            mux,
            local: local.clone(),
            remote,
            announcements: settings.remote_forwards.iter().map(listen_frame).collect(),
        };
        driver.announce().await;
        let driver = tokio::spawn(driver.run(events, commands, cancel.clone()));

        Ok(Self {
            cancel,
            local,
            driver,
        })
    }

    /// Addresses the local listeners are bound to
    pub async fn listen_addrs(&self) -> Vec<(Protocol, SocketAddr)> {
        self.local.listen_addrs().await
    }

    /// Wait until the session is cancelled from outside
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Stop listeners and relays, flush the channel and wait for all tasks
    pub async fn shutdown(self) {
        info!("Shutting down");
        self.cancel.cancel();
        self.local.shutdown().await;
        if let Err(e) = self.driver.await {
            warn!("Session task failed: {}", e);
        }
    }
}

fn listen_frame(rule: &ForwardRule) -> Frame {
    Frame::listen(
        rule.protocol,
        &rule.listen.to_string(),
        &rule.target.to_string(),
    )
}

/// Owner of the multiplexer
struct Driver {
    channel: SharedFileChannel,
    mux: Multiplexer,
    local: Arc<LocalToRemoteTunnel>,
    remote: RemoteToLocalTunnel,
    /// LISTEN frames for the remote forwards
    announcements: Vec<Frame>,
}

impl Driver {
    async fn run(
        mut self,
        mut events: mpsc::Receiver<ChannelEvent>,
        mut commands: mpsc::Receiver<StreamCommand>,
        cancel: CancellationToken,
    ) {
        let mut sweep_interval = tokio::time::interval(SWEEP_INTERVAL);
        sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = sweep_interval.tick() => {
                    let expired = self.mux.sweep(Instant::now());
                    if expired > 0 {
                        debug!("Dropped {} idle UDP streams", expired);
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                Some(cmd) = commands.recv() => {
                    self.mux.process_command(cmd);
                    for _ in 1..COMMAND_BATCH {
                        match commands.try_recv() {
                            Ok(cmd) => self.mux.process_command(cmd),
                            Err(_) => break,
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }

            let frames = self.mux.take_send_queue();
            self.channel.write_all(&frames).await;
        }

        let closed = self.mux.reset_all();
        if closed > 0 {
            debug!("Closed {} streams on shutdown", closed);
        }
        let frames = self.mux.take_send_queue();
        self.channel.write_all(&frames).await;
        self.channel.shutdown().await;
    }

    async fn announce(&self) {
        if self.announcements.is_empty() {
            return;
        }
        debug!("Announcing {} remote forwards", self.announcements.len());
        self.channel.write_all(&self.announcements).await;
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Frame(frame) => match self.mux.handle_frame(frame) {
                Some(Incoming::Stream(handle)) => self.remote.accept(handle),
                Some(Incoming::Listen {
                    protocol,
                    listen,
                    target,
                }) => self.listen_for_peer(protocol, &listen, &target).await,
                None => {}
            },
            ChannelEvent::PeerSession { restarted } => {
                if restarted {
                    let closed = self.mux.reset_all();
                    info!("Peer restarted, closed {} streams", closed);
                }
                self.announce().await;
            }
            ChannelEvent::TimedOut => {
                let closed = self.mux.reset_all();
                warn!("Channel timed out, closed {} streams", closed);
            }
            ChannelEvent::Resumed => info!("Peer is back"),
        }
    }

    async fn listen_for_peer(&self, protocol: Protocol, listen: &str, target: &str) {
        let rule = match ForwardRule::from_endpoints(protocol, listen, target) {
            Ok(rule) => rule,
            Err(e) => {
                warn!("Ignoring listen request from peer: {}", e);
                return;
            }
        };
        if let Err(e) = self.local.add_listener(&rule).await {
            warn!("Cannot listen for {}: {}", rule, e);
        }
    }
}
