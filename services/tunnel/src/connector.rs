//! Upstream connection establishment.
//!
//! Resolves a [`Target`], applies latency and keepalive tuning to a fresh
//! socket, and connects. The returned stream is only handed back once the
//! kernel has confirmed the connect completed; an in-progress connect is
//! never reported as success.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::DEFAULT_CONNECT_TIMEOUT;
use crate::error::ConnectError;
use crate::target::Target;

/// TCP keepalive parameters for upstream sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Idle time before the first probe.
    pub idle: Duration,
    /// Interval between probes.
    pub interval: Duration,
    /// Unanswered probes before the connection is dropped.
    pub retries: u32,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            idle: Duration::from_secs(10),
            interval: Duration::from_secs(5),
            retries: 3,
        }
    }
}

/// Opens tuned upstream connections.
#[derive(Debug, Clone)]
pub struct Connector {
    keepalive: KeepaliveConfig,
    connect_timeout: Duration,
}

impl Connector {
    pub fn new(keepalive: KeepaliveConfig, connect_timeout: Duration) -> Self {
        Self {
            keepalive,
            connect_timeout,
        }
    }

    /// Resolve `target` and connect to the first address that accepts.
    pub async fn connect(&self, target: &Target) -> Result<TcpStream, ConnectError> {
        let addrs = self.resolve(target).await?;

        let mut last_err = ConnectError::NoAddress(target.clone());
        for addr in addrs {
            match self.connect_addr(addr).await {
                Ok(stream) => {
                    debug!(upstream = %target, upstream_addr = %addr, "Upstream connected");
                    return Ok(stream);
                }
                Err(e) => {
                    warn!(
                        upstream = %target,
                        upstream_addr = %addr,
                        error = %e,
                        "Upstream connect attempt failed"
                    );
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }

    async fn resolve(&self, target: &Target) -> Result<Vec<SocketAddr>, ConnectError> {
        if let Some(ip) = target.ip() {
            return Ok(vec![SocketAddr::new(ip, target.port)]);
        }

        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((target.host.as_str(), target.port))
            .await
            .map_err(|source| ConnectError::Resolve {
                target: target.clone(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ConnectError::NoAddress(target.clone()));
        }
        Ok(addrs)
    }

    /// Connect to a single resolved address.
    async fn connect_addr(&self, addr: SocketAddr) -> Result<TcpStream, ConnectError> {
        let socket = self
            .tuned_socket(addr)
            .map_err(|source| ConnectError::Socket { addr, source })?;

        // TcpSocket::connect waits for writability and checks SO_ERROR.
        match timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectError::Connect { addr, source }),
            Err(_) => Err(ConnectError::Timeout(addr)),
        }
    }

    fn tuned_socket(&self, addr: SocketAddr) -> io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        socket.set_nodelay(true)?;
        socket.set_keepalive(true)?;

        let keepalive = TcpKeepalive::new()
            .with_time(self.keepalive.idle)
            .with_interval(self.keepalive.interval);
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let keepalive = keepalive.with_retries(self.keepalive.retries);
        SockRef::from(&socket).set_tcp_keepalive(&keepalive)?;

        Ok(socket)
    }
}

impl Default for Connector {
    fn default() -> Self {
        Self::new(KeepaliveConfig::default(), DEFAULT_CONNECT_TIMEOUT)
    }
}
