#![forbid(unsafe_code)]

//! `acnetd` binary: configuration, logging, and the event loop.

use acnet_daemon::daemon::{run, Daemon};
use acnet_daemon::DaemonConfig;
use acnet_core::NodeName;
use anyhow::Context;
use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "acnetd", about = "User-space ACNET multiplexing daemon")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Peer UDP port (overrides the config file).
    #[arg(long)]
    port: Option<u16>,

    /// Override for the local host name.
    #[arg(long)]
    hostname: Option<String>,

    /// Additional virtual node names to host (repeatable).
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// Logging verbosity when RUST_LOG is not set.
    #[arg(long)]
    log_level: Option<String>,
}

/// DNS lookup of our own host name; the address is how imported node-table
/// entries are recognized as "us".
fn discover_my_ip(host: &str) -> Option<Ipv4Addr> {
    (host, 0u16)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(v4) if !v4.is_loopback() => Some(v4),
            _ => None,
        })
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut cfg = match &args.config {
        Some(path) => DaemonConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => DaemonConfig::default(),
    };

    if let Some(port) = args.port {
        cfg.peer_port = port;
        cfg.client_port = port + 1;
    }
    if args.hostname.is_some() {
        cfg.hostname = args.hostname.clone();
    }
    cfg.nodes.extend(args.nodes.iter().cloned());
    if args.log_level.is_some() {
        cfg.log_level = args.log_level.clone();
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(cfg.log_level.clone().unwrap_or_else(|| "info".into()))
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let hostname = cfg.hostname.clone().unwrap_or_else(|| {
        gethostname::gethostname().to_string_lossy().into_owned()
    });
    let my_ip = discover_my_ip(&hostname);

    if my_ip.is_none() {
        warn!(host = %hostname, "DNS failure; we won't be able to recognize local traffic");
    }

    // Only the host part of a fully-qualified name becomes the node name.
    let short = hostname.split('.').next().unwrap_or(&hostname);
    let host_name = NodeName::from_str(short);

    info!(host = short, ip = ?my_ip, "starting acnetd");

    let now_sec = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let daemon = Daemon::new(&cfg, my_ip, host_name, now_sec);

    run(daemon, &cfg).await
}
