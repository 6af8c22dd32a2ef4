//! TCP listener and connection admission.
//!
//! Binds the listening socket, accepts clients, and hands each one to its
//! own task running a [`Connection`]. Concurrency is bounded by a semaphore:
//! a client arriving when every permit is taken is dropped immediately.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol as SocketProtocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn, Instrument};

use crate::config::{Config, DEFAULT_MAX_CONNECTIONS};
use crate::connection::{Connection, ConnectionContext, ConnectionEnd, ConnectionState};
use crate::error::{ListenerError, StepError};
use crate::relay::RelayEnd;
use crate::shutdown::{self, Shutdown};

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// How long shutdown waits for in-flight connections to close.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to. IPv6 addresses listen dual-stack.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Grace period for in-flight connections at shutdown.
    pub drain_timeout: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.max_connections,
            ..Self::new(config.bind_addr())
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections refused because every permit was taken.
    pub connections_rejected: AtomicU64,
    /// Negotiations that were rejected, malformed, or timed out.
    pub negotiations_failed: AtomicU64,
    /// Upstream connections established.
    pub upstream_connected: AtomicU64,
    /// Upstream connections that failed or timed out.
    pub upstream_failed: AtomicU64,
    /// Relays ended by the idle watchdog.
    pub relay_timeouts: AtomicU64,
    /// Bytes relayed client to upstream.
    pub bytes_to_upstream: AtomicU64,
    /// Bytes relayed upstream to client.
    pub bytes_from_upstream: AtomicU64,
}

impl ListenerStats {
    fn record(&self, end: &ConnectionEnd) {
        let counter = match end {
            ConnectionEnd::Relayed(outcome) => {
                self.upstream_connected.fetch_add(1, Ordering::Relaxed);
                self.bytes_to_upstream
                    .fetch_add(outcome.bytes_to_upstream, Ordering::Relaxed);
                self.bytes_from_upstream
                    .fetch_add(outcome.bytes_from_upstream, Ordering::Relaxed);
                match outcome.end {
                    Ok(RelayEnd::IdleTimeout) => &self.relay_timeouts,
                    _ => return,
                }
            }
            ConnectionEnd::Negotiation(_) => &self.negotiations_failed,
            ConnectionEnd::Connect(_) => &self.upstream_failed,
            ConnectionEnd::Step {
                state: ConnectionState::Negotiating,
                error: StepError::TimedOut,
            } => &self.negotiations_failed,
            ConnectionEnd::Step {
                state: ConnectionState::Connecting,
                error: StepError::TimedOut,
            } => &self.upstream_failed,
            ConnectionEnd::Step { .. } | ConnectionEnd::Io(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Create the listening socket: reuse-address, full backlog, dual-stack
/// for IPv6.
fn listen_socket(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(SocketProtocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(libc::SOMAXCONN)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// A TCP listener for the tunnel.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    context: Arc<ConnectionContext>,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Bind the listening socket. Must be called within a tokio runtime.
    pub fn bind(
        config: ListenerConfig,
        context: Arc<ConnectionContext>,
    ) -> Result<Self, ListenerError> {
        let addr = config.bind_addr;
        let std_listener =
            listen_socket(addr).map_err(|source| ListenerError::Bind { addr, source })?;
        let listener = TcpListener::from_std(std_listener)?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            protocol = %context.negotiator.protocol(),
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            context,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Bind a listener speaking the protocol `config` selects.
    pub fn from_config(config: &Config) -> Result<Self, ListenerError> {
        Self::bind(
            ListenerConfig::from_config(config),
            Arc::new(ConnectionContext::from_config(config)),
        )
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until shutdown, then wait briefly for in-flight
    /// connections to close.
    pub async fn run(self: Arc<Self>, mut shutdown: Shutdown) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = shutdown::requested(&mut shutdown) => break,
            };

            let (stream, peer_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    self.stats
                        .connections_rejected
                        .fetch_add(1, Ordering::Relaxed);
                    warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                    continue;
                }
            };

            self.stats
                .connections_accepted
                .fetch_add(1, Ordering::Relaxed);
            self.stats
                .connections_active
                .fetch_add(1, Ordering::Relaxed);

            let context = Arc::clone(&self.context);
            let stats = Arc::clone(&self.stats);
            let mut shutdown = shutdown.clone();

            tokio::spawn(
                async move {
                    let conn = Connection::new(stream, peer_addr, context.negotiator.protocol());
                    let end = conn.run(&context, &mut shutdown).await;
                    stats.record(&end);

                    stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                    stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                    drop(permit);
                }
                .instrument(tracing::info_span!("connection", peer = %peer_addr)),
            );
        }

        info!(bind_addr = %local_addr, "Listener stopped accepting");
        self.drain().await;
        Ok(())
    }

    /// Wait until every permit is back or the drain timeout passes.
    async fn drain(&self) {
        let permits = u32::try_from(self.config.max_connections).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(
            self.config.drain_timeout,
            self.conn_semaphore.acquire_many(permits),
        )
        .await;
        match drained {
            Ok(_) => info!("All connections closed"),
            Err(_) => warn!(
                active = self.stats.connections_active.load(Ordering::Relaxed),
                "Drain timeout, abandoning remaining connections"
            ),
        }
    }
}
