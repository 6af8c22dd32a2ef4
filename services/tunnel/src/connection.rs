//! Per-connection supervisor.
//!
//! A [`Connection`] owns the client socket from accept until close and the
//! upstream socket once one is established. It walks a fixed state machine:
//!
//! ```text
//! Negotiating -> Connecting -> Relaying -> Closing -> Closed
//!      |              |
//!      +--------------+------> Closing (on failure, timeout, shutdown)
//! ```
//!
//! Each blocking step is raced against its own deadline and the shutdown
//! signal; whichever loses is dropped. Both sockets are released exactly
//! once, either by [`Connection::teardown`] or on drop.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Shutdown as SocketShutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use socket2::SockRef;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connector::Connector;
use crate::error::{ConnectError, NegotiationError, StepError};
use crate::negotiate::{self, Negotiator, Protocol};
use crate::relay::{self, RelayConfig, RelayEnd, RelayOutcome};
use crate::shutdown::{self, Shutdown};
use crate::target::Target;

/// Lifecycle position of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Negotiating,
    Connecting,
    Relaying,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Negotiating => "negotiating",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// How a connection ended.
#[derive(Debug)]
pub enum ConnectionEnd {
    /// The relay ran and finished.
    Relayed(RelayOutcome),
    /// The client was rejected or spoke nonsense.
    Negotiation(NegotiationError),
    /// The upstream could not be reached.
    Connect(ConnectError),
    /// A step ran out of time or was interrupted by shutdown.
    Step {
        state: ConnectionState,
        error: StepError,
    },
    /// Writing the success reply failed.
    Io(io::Error),
}

impl ConnectionEnd {
    /// Short reason code for structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectionEnd::Relayed(outcome) => match &outcome.end {
                Ok(RelayEnd::ClientClosed) => "client_closed",
                Ok(RelayEnd::UpstreamClosed) => "upstream_closed",
                Ok(RelayEnd::IdleTimeout) => "idle_timeout",
                Ok(RelayEnd::Shutdown) => "shutdown",
                Err(_) => "relay_error",
            },
            ConnectionEnd::Negotiation(e) => e.reason(),
            ConnectionEnd::Connect(e) => e.reason(),
            ConnectionEnd::Step {
                error: StepError::TimedOut,
                state: ConnectionState::Negotiating,
            } => "handshake_timeout",
            ConnectionEnd::Step {
                error: StepError::TimedOut,
                ..
            } => "connect_timeout",
            ConnectionEnd::Step {
                error: StepError::Shutdown,
                ..
            } => "shutdown",
            ConnectionEnd::Io(_) => "io_error",
        }
    }

    /// Whether the client may still have bytes in flight after a rejection
    /// reply, so closing outright would reset the connection.
    fn lingers(&self) -> bool {
        match self {
            ConnectionEnd::Negotiation(NegotiationError::EmptyRequest)
            | ConnectionEnd::Negotiation(NegotiationError::Io(_)) => false,
            ConnectionEnd::Negotiation(_) | ConnectionEnd::Connect(_) => true,
            ConnectionEnd::Step {
                state: ConnectionState::Connecting,
                error: StepError::TimedOut,
            } => true,
            _ => false,
        }
    }
}

/// Upper bound on draining a rejected client before close.
pub const REJECT_LINGER: Duration = Duration::from_secs(1);

/// Everything a connection needs that is shared across connections.
pub struct ConnectionContext {
    pub negotiator: Arc<dyn Negotiator>,
    pub connector: Connector,
    pub relay: RelayConfig,
    pub handshake_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ConnectionContext {
    pub fn from_config(config: &Config) -> Self {
        Self {
            negotiator: negotiate::from_config(config),
            connector: Connector::new(config.keepalive, config.connect_timeout),
            relay: RelayConfig::from_config(config),
            handshake_timeout: config.handshake_timeout,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// Run `fut` until it finishes, `limit` elapses, or shutdown is requested.
pub async fn bounded<F: Future>(
    limit: Duration,
    shutdown: &mut Shutdown,
    fut: F,
) -> Result<F::Output, StepError> {
    tokio::select! {
        out = fut => Ok(out),
        _ = tokio::time::sleep(limit) => Err(StepError::TimedOut),
        _ = shutdown::requested(shutdown) => Err(StepError::Shutdown),
    }
}

/// One accepted client and, once connected, its upstream.
pub struct Connection {
    peer: SocketAddr,
    protocol: Protocol,
    state: ConnectionState,
    client: Option<TcpStream>,
    upstream: Option<TcpStream>,
    target: Option<Target>,
}

impl Connection {
    pub fn new(client: TcpStream, peer: SocketAddr, protocol: Protocol) -> Self {
        Self {
            peer,
            protocol,
            state: ConnectionState::Negotiating,
            client: Some(client),
            upstream: None,
            target: None,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Target chosen by negotiation, once known.
    pub fn target(&self) -> Option<&Target> {
        self.target.as_ref()
    }

    /// Drive the connection to completion and release its sockets.
    pub async fn run(mut self, ctx: &ConnectionContext, shutdown: &mut Shutdown) -> ConnectionEnd {
        let end = self.drive(ctx, shutdown).await;

        let reached = self.state;
        self.state = ConnectionState::Closing;
        if end.lingers() {
            self.linger(shutdown).await;
        }
        let released = self.teardown();

        match &end {
            ConnectionEnd::Relayed(outcome) => info!(
                upstream = ?self.target.as_ref().map(|t| t.to_string()),
                reason = end.reason(),
                bytes_to_upstream = outcome.bytes_to_upstream,
                bytes_from_upstream = outcome.bytes_from_upstream,
                released,
                "Connection closed"
            ),
            ConnectionEnd::Io(e) => warn!(state = %reached, error = %e, released, "Connection failed"),
            _ => info!(state = %reached, reason = end.reason(), released, "Connection ended early"),
        }

        end
    }

    async fn drive(&mut self, ctx: &ConnectionContext, shutdown: &mut Shutdown) -> ConnectionEnd {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => return ConnectionEnd::Io(io::ErrorKind::NotConnected.into()),
        };

        self.state = ConnectionState::Negotiating;
        let target = match bounded(
            ctx.handshake_timeout,
            shutdown,
            ctx.negotiator.negotiate(client),
        )
        .await
        {
            Ok(Ok(target)) => target,
            Ok(Err(e)) => return ConnectionEnd::Negotiation(e),
            Err(error) => {
                return ConnectionEnd::Step {
                    state: self.state,
                    error,
                }
            }
        };
        debug!(upstream = %target, protocol = %self.protocol, "Negotiated");

        self.state = ConnectionState::Connecting;
        let connected = bounded(ctx.connect_timeout, shutdown, ctx.connector.connect(&target)).await;
        self.target = Some(target);
        let stream = match connected {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                let _ = ctx.negotiator.reply_connect_failed(client).await;
                return ConnectionEnd::Connect(e);
            }
            Err(error) => {
                if error == StepError::TimedOut {
                    let _ = ctx.negotiator.reply_connect_failed(client).await;
                }
                return ConnectionEnd::Step {
                    state: self.state,
                    error,
                };
            }
        };
        let upstream = self.upstream.insert(stream);

        let bound = match upstream.local_addr() {
            Ok(addr) => addr,
            Err(e) => return ConnectionEnd::Io(e),
        };
        if let Err(e) = ctx.negotiator.reply_connected(client, bound).await {
            return ConnectionEnd::Io(e);
        }

        self.state = ConnectionState::Relaying;
        ConnectionEnd::Relayed(relay::relay(client, upstream, &ctx.relay, shutdown).await)
    }

    /// Send FIN after the reply, then discard client input until EOF, bounded
    /// by [`REJECT_LINGER`]. Closing with unread input sends RST.
    async fn linger(&mut self, shutdown: &mut Shutdown) {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => return,
        };
        if SockRef::from(&*client)
            .shutdown(SocketShutdown::Write)
            .is_err()
        {
            return;
        }

        let drain = async {
            let mut buf = [0u8; 4096];
            let mut discarded = 0usize;
            loop {
                match client.read(&mut buf).await {
                    Ok(0) | Err(_) => return discarded,
                    Ok(n) => discarded += n,
                }
            }
        };
        if let Ok(discarded) = bounded(REJECT_LINGER, shutdown, drain).await {
            debug!(discarded, "Drained rejected client");
        }
    }

    /// Shut down and release both sockets.
    ///
    /// Returns how many sockets this call released; a second call returns 0.
    pub fn teardown(&mut self) -> usize {
        let mut released = 0;
        for stream in [self.client.take(), self.upstream.take()]
            .into_iter()
            .flatten()
        {
            // The peer may already be gone.
            let _ = SockRef::from(&stream).shutdown(SocketShutdown::Both);
            released += 1;
        }
        self.state = ConnectionState::Closed;
        released
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.teardown();
    }
}
