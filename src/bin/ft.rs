//! File Tunnel
//!
//! Forwards TCP and UDP through a pair of files both hosts can access:
//! - Listens on local forwards and relays them to the peer
//! - Connects streams opened by the peer to their targets
//! - Asks the peer to listen for remote forwards

use anyhow::{Context, Result};
use clap::Parser;
use file_tunnel::{config::Config, Session};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// File Tunnel - TCP and UDP forwarding over shared files
#[derive(Parser, Debug)]
#[command(name = "ft")]
#[command(about = "File Tunnel - TCP and UDP forwarding over shared files")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// File the peer writes
    #[arg(short, long)]
    read_from: Option<PathBuf>,

    /// File this instance writes
    #[arg(short, long)]
    write_to: Option<PathBuf>,

    /// Write file size in bytes that triggers a purge
    #[arg(long)]
    purge_size: Option<u64>,

    /// Milliseconds without data before all streams are closed
    #[arg(long)]
    tunnel_timeout: Option<u64>,

    /// Copy the read file before parsing it (needed for RDP drive redirection)
    #[arg(long)]
    isolated_reads: bool,

    /// Poll interval of the read file in milliseconds
    #[arg(long)]
    read_duration: Option<u64>,

    /// Local TCP forward, [listenAddr:]listenPort:targetAddr:targetPort
    #[arg(short = 'L', long = "tcp-forward")]
    tcp_forwards: Vec<String>,

    /// Local UDP forward, [listenAddr:]listenPort:targetAddr:targetPort
    #[arg(short = 'U', long = "udp-forward")]
    udp_forwards: Vec<String>,

    /// TCP forward listening on the peer, [listenAddr:]listenPort:targetAddr:targetPort
    #[arg(short = 'R', long = "remote-tcp-forward")]
    remote_tcp_forwards: Vec<String>,

    /// UDP forward listening on the peer
    #[arg(long = "remote-udp-forward")]
    remote_udp_forwards: Vec<String>,

    /// Source address for outgoing UDP datagrams
    #[arg(long)]
    udp_send_from: Option<String>,

    /// Milliseconds after which an idle UDP stream is dropped
    #[arg(long)]
    udp_idle_timeout: Option<u64>,

    /// Milliseconds allowed for connecting to a TCP target
    #[arg(long)]
    connect_timeout: Option<u64>,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Write the merged configuration to this file and exit
    #[arg(long, value_name = "PATH")]
    save_config: Option<PathBuf>,
}

impl Args {
    /// Apply command line values on top of a loaded configuration
    fn merge_into(self, mut config: Config) -> Config {
        if let Some(path) = self.read_from {
            config.read_from = path;
        }
        if let Some(path) = self.write_to {
            config.write_to = path;
        }
        if let Some(size) = self.purge_size {
            config.purge_size = size;
        }
        if let Some(ms) = self.tunnel_timeout {
            config.tunnel_timeout_ms = ms;
        }
        if let Some(ms) = self.read_duration {
            config.read_duration_ms = ms;
        }
        if let Some(address) = self.udp_send_from {
            config.udp_send_from = address;
        }
        if let Some(ms) = self.udp_idle_timeout {
            config.udp_idle_timeout_ms = ms;
        }
        if let Some(ms) = self.connect_timeout {
            config.connect_timeout_ms = ms;
        }
        config.isolated_reads |= self.isolated_reads;
        config.verbose |= self.verbose;
        config.tcp_forwards.extend(self.tcp_forwards);
        config.udp_forwards.extend(self.udp_forwards);
        config.remote_tcp_forwards.extend(self.remote_tcp_forwards);
        config.remote_udp_forwards.extend(self.remote_udp_forwards);
        config
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    let save_to = args.save_config.clone();
    let config = args.merge_into(config);

    init_logging(config.verbose);

    let settings = match config.validate() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Some(path) = save_to {
        config
            .save(&path)
            .with_context(|| format!("Failed to save config to {}", path.display()))?;
        info!("Saved configuration to {}", path.display());
        return Ok(());
    }

    info!("File Tunnel v{}", file_tunnel::VERSION);
    for rule in &settings.forwards {
        info!("Forward: {}", rule);
    }
    for rule in &settings.remote_forwards {
        info!("Remote forward: {}", rule);
    }

    let cancel = CancellationToken::new();
    let session = Session::start(settings, cancel.clone())
        .await
        .context("Failed to start tunnel")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
        }
        _ = session.cancelled() => {}
    }

    session.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saved_config_keeps_command_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ft.toml");
        let args = Args::parse_from([
            "ft",
            "-r",
            "in",
            "-w",
            "out",
            "-L",
            "8080:127.0.0.1:80",
            "--save-config",
            path.to_str().unwrap(),
        ]);
        assert_eq!(args.save_config.as_deref(), Some(path.as_path()));

        let config = args.merge_into(Config::default());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.read_from, PathBuf::from("in"));
        assert_eq!(loaded.write_to, PathBuf::from("out"));
        assert_eq!(loaded.tcp_forwards, vec!["8080:127.0.0.1:80".to_string()]);
        assert!(loaded.validate().is_ok());
    }
}
