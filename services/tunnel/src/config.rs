//! Tunnel configuration.
//!
//! Everything is explicit runtime configuration: command-line flags with
//! `TUNNEL_*` environment fallbacks, resolved into a validated [`Config`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use clap::Parser;
use tokio::sync::Semaphore;

use crate::connector::KeepaliveConfig;
use crate::logging::LogFormat;
use crate::negotiate::Protocol;
use crate::reverse::ReverseTunnelSpec;
use crate::target::{RoutingPolicy, Target};

/// Default per-operation I/O quota and header read cap (128 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 128 * 1024;

/// Default relay inactivity window.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default bound on the negotiation step.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on the upstream connect step.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of runtime worker threads.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default cap on concurrently handled connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Marker embedded in the HeaderBootstrap success line.
pub const DEFAULT_STATUS_MARKER: &str = "@TMYCOMNECTVPN";

/// Resolved tunnel configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to listen on. An IPv6 address listens dual-stack.
    pub bind_address: IpAddr,

    /// Port to listen on.
    pub port: u16,

    /// Negotiation protocol spoken by clients.
    pub protocol: Protocol,

    /// Shared secret for HeaderBootstrap. Empty disables the check.
    pub passphrase: String,

    /// Relay ends after this long with no traffic in either direction.
    pub idle_timeout: Duration,

    /// Bound on the negotiation step.
    pub handshake_timeout: Duration,

    /// Bound on the upstream connect step.
    pub connect_timeout: Duration,

    /// Header read cap and per-operation relay quota, in bytes.
    pub buffer_size: usize,

    /// Runtime worker threads. 1 runs a single event loop.
    pub worker_count: usize,

    /// Connections beyond this are refused at accept time.
    pub max_connections: usize,

    /// Upstream routing for SOCKS5 connections.
    pub routing: RoutingPolicy,

    /// Marker embedded in the HeaderBootstrap success reply.
    pub status_marker: String,

    /// Keepalive parameters for upstream sockets.
    pub keepalive: KeepaliveConfig,

    /// Try splice(2) before falling back to buffered copy.
    pub zero_copy: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Optional outbound reverse port forward started alongside the listener.
    pub reverse_tunnel: Option<ReverseTunnelSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 80,
            protocol: Protocol::Header,
            passphrase: String::new(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            routing: RoutingPolicy::Requested,
            status_marker: DEFAULT_STATUS_MARKER.to_string(),
            keepalive: KeepaliveConfig::default(),
            zero_copy: true,
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
            reverse_tunnel: None,
        }
    }
}

impl Config {
    /// Socket address the listener binds.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Reject settings the tunnel cannot run with.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.buffer_size > 0, "buffer size must be greater than zero");
        ensure!(self.worker_count > 0, "worker count must be greater than zero");
        ensure!(
            self.max_connections > 0,
            "max connections must be greater than zero"
        );
        ensure!(
            self.max_connections <= Semaphore::MAX_PERMITS,
            "max connections must be at most {}",
            Semaphore::MAX_PERMITS
        );
        ensure!(
            !self.idle_timeout.is_zero(),
            "idle timeout must be at least one second"
        );
        ensure!(
            !self.handshake_timeout.is_zero(),
            "handshake timeout must be at least one second"
        );
        ensure!(
            !self.connect_timeout.is_zero(),
            "connect timeout must be at least one second"
        );
        ensure!(
            !self.keepalive.idle.is_zero(),
            "keepalive idle time must be at least one second"
        );
        ensure!(
            !self.keepalive.interval.is_zero(),
            "keepalive interval must be at least one second"
        );
        ensure!(
            self.keepalive.retries > 0,
            "keepalive retries must be greater than zero"
        );
        Ok(())
    }
}

/// Command-line arguments.
#[derive(Debug, Parser)]
#[command(name = "tunnel", version, about = "TCP tunneling proxy")]
pub struct Args {
    /// Address to listen on (an IPv6 address listens dual-stack).
    #[arg(long, env = "TUNNEL_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: IpAddr,

    /// Port to listen on.
    #[arg(long, short, env = "TUNNEL_PORT", default_value_t = 80)]
    pub port: u16,

    /// Negotiation protocol.
    #[arg(long, env = "TUNNEL_PROTOCOL", value_enum, default_value = "header")]
    pub protocol: Protocol,

    /// Shared secret checked against X-Pass.
    #[arg(long, env = "TUNNEL_PASSPHRASE", default_value = "", hide_env_values = true)]
    pub passphrase: String,

    /// Relay inactivity window in seconds.
    #[arg(long, env = "TUNNEL_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Negotiation timeout in seconds.
    #[arg(long, env = "TUNNEL_HANDSHAKE_TIMEOUT_SECS", default_value_t = 30)]
    pub handshake_timeout_secs: u64,

    /// Upstream connect timeout in seconds.
    #[arg(long, env = "TUNNEL_CONNECT_TIMEOUT_SECS", default_value_t = 10)]
    pub connect_timeout_secs: u64,

    /// Header read cap and relay quota in bytes.
    #[arg(long, env = "TUNNEL_BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,

    /// Runtime worker threads.
    #[arg(long, env = "TUNNEL_WORKER_COUNT", default_value_t = DEFAULT_WORKER_COUNT)]
    pub worker_count: usize,

    /// Maximum concurrent connections.
    #[arg(long, env = "TUNNEL_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Pin every SOCKS5 connection to this host:port instead of the requested one.
    #[arg(long, env = "TUNNEL_SOCKS_UPSTREAM")]
    pub socks_upstream: Option<Target>,

    /// Marker embedded in the HeaderBootstrap success reply.
    #[arg(long, env = "TUNNEL_STATUS_MARKER", default_value = DEFAULT_STATUS_MARKER)]
    pub status_marker: String,

    /// Upstream keepalive idle time in seconds.
    #[arg(long, env = "TUNNEL_KEEPALIVE_IDLE_SECS", default_value_t = 10)]
    pub keepalive_idle_secs: u64,

    /// Upstream keepalive probe interval in seconds.
    #[arg(long, env = "TUNNEL_KEEPALIVE_INTERVAL_SECS", default_value_t = 5)]
    pub keepalive_interval_secs: u64,

    /// Upstream keepalive probe count.
    #[arg(long, env = "TUNNEL_KEEPALIVE_RETRIES", default_value_t = 3)]
    pub keepalive_retries: u32,

    /// Disable the splice(2) relay path.
    #[arg(long, env = "TUNNEL_NO_ZERO_COPY")]
    pub no_zero_copy: bool,

    /// Log level, used when RUST_LOG is unset.
    #[arg(long, env = "TUNNEL_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log line format.
    #[arg(long, env = "TUNNEL_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// SSH server for an outbound reverse port forward.
    #[arg(long, env = "TUNNEL_REVERSE_SSH_HOST")]
    pub reverse_ssh_host: Option<String>,

    /// SSH port of the reverse forward server.
    #[arg(long, env = "TUNNEL_REVERSE_SSH_PORT", default_value_t = 22)]
    pub reverse_ssh_port: u16,

    /// SSH user for the reverse forward.
    #[arg(long, env = "TUNNEL_REVERSE_SSH_USER")]
    pub reverse_ssh_user: Option<String>,

    /// SSH password for the reverse forward.
    #[arg(long, env = "TUNNEL_REVERSE_SSH_PASSWORD", hide_env_values = true)]
    pub reverse_ssh_password: Option<String>,

    /// Port opened on the SSH server that forwards back to the listener.
    #[arg(long, env = "TUNNEL_REVERSE_REMOTE_PORT")]
    pub reverse_remote_port: Option<u16>,
}

impl Args {
    /// Resolve arguments into a validated configuration.
    pub fn into_config(self) -> Result<Config> {
        let reverse_tunnel = match self.reverse_ssh_host {
            None => None,
            Some(ssh_host) => {
                let username = self
                    .reverse_ssh_user
                    .context("--reverse-ssh-user is required with --reverse-ssh-host")?;
                let remote_port = self
                    .reverse_remote_port
                    .context("--reverse-remote-port is required with --reverse-ssh-host")?;
                Some(ReverseTunnelSpec {
                    ssh_host,
                    ssh_port: self.reverse_ssh_port,
                    username,
                    password: self.reverse_ssh_password.unwrap_or_default(),
                    local_port: self.port,
                    remote_port,
                })
            }
        };

        if self.socks_upstream.is_some() && self.protocol != Protocol::Socks5 {
            bail!("--socks-upstream only applies to --protocol socks5");
        }

        let config = Config {
            bind_address: self.bind_address,
            port: self.port,
            protocol: self.protocol,
            passphrase: self.passphrase,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            buffer_size: self.buffer_size,
            worker_count: self.worker_count,
            max_connections: self.max_connections,
            routing: self
                .socks_upstream
                .map(RoutingPolicy::Fixed)
                .unwrap_or_default(),
            status_marker: self.status_marker,
            keepalive: KeepaliveConfig {
                idle: Duration::from_secs(self.keepalive_idle_secs),
                interval: Duration::from_secs(self.keepalive_interval_secs),
                retries: self.keepalive_retries,
            },
            zero_copy: !self.no_zero_copy,
            log_level: self.log_level,
            log_format: self.log_format,
            reverse_tunnel,
        };

        config.validate()?;
        Ok(config)
    }
}
