//! plfm-vt tunnel
//!
//! TCP tunneling proxy. Clients open a connection, name an upstream with
//! either an HTTP-like header bootstrap or a SOCKS5 CONNECT, and from then
//! on bytes are relayed unchanged in both directions until either side
//! closes or the connection goes idle.

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod listener;
pub mod logging;
pub mod negotiate;
pub mod relay;
pub mod reverse;
pub mod shutdown;
pub mod target;

pub use config::{Args, Config};
pub use connection::{Connection, ConnectionContext, ConnectionEnd, ConnectionState};
pub use connector::{Connector, KeepaliveConfig};
pub use error::{ConnectError, ListenerError, NegotiationError, RelayError, StepError};
pub use listener::{Listener, ListenerConfig, ListenerStats};
pub use negotiate::{HeaderBootstrap, Negotiator, Protocol, Socks5Handshake};
pub use relay::{RelayConfig, RelayEnd, RelayOutcome};
pub use reverse::{ReverseForwarder, ReverseTunnelSpec, SshReverseForwarder};
pub use target::{RoutingPolicy, Target};
