//! # File Tunnel
//!
//! Forwards TCP and UDP connections between two hosts that cannot reach each
//! other over the network but can both access the same files, such as a
//! redirected RDP drive or a shared folder.
//!
//! ## Features
//!
//! - **Local and remote forwards** for TCP and UDP
//! - **Many streams** multiplexed over one pair of files
//! - **Bounded files** through cooperative purging
//! - **Restart detection** so stale traffic is never replayed
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   Session Layer                      │
//! │      (Listeners, target connections, relaying)       │
//! ├─────────────────────────────────────────────────────┤
//! │                  Multiplexing Layer                  │
//! │         (Stream ids, sequence checks, framing)       │
//! ├─────────────────────────────────────────────────────┤
//! │                   Transport Layer                    │
//! │   (Shared file: polling, buffering, purge, liveness) │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Each instance appends to the file the other one reads:
//!
//! ```text
//!   host A                                        host B
//!   ft -w a-to-b -r b-to-a   ──── a-to-b ───▶   ft -w b-to-a -r a-to-b
//!                            ◀─── b-to-a ────
//! ```

pub mod config;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;
pub use session::Session;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Magic bytes at the start of every channel file
pub(crate) const MAGIC: [u8; 4] = *b"FTUN";

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}
