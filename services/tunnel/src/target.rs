//! Upstream targets and the routing policy that may override them.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use thiserror::Error;

/// Port used when a target string carries no port.
pub const DEFAULT_TARGET_PORT: u16 = 22;

/// A host name or literal address plus port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    /// Host name or literal address, without IPv6 brackets.
    pub host: String,
    /// Destination port.
    pub port: u16,
}

/// Target string could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid target {0:?}")]
pub struct InvalidTarget(pub String);

impl Target {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Whether the host is a literal IP address (no resolution needed).
    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

impl From<SocketAddr> for Target {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Target {
    type Err = InvalidTarget;

    /// Accepts `host:port`, `[v6]:port`, a bare IPv6 literal, or a bare host.
    /// A missing port defaults to 22.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InvalidTarget(s.to_string());
        let s_trim = s.trim();

        let (host, port) = if let Some(rest) = s_trim.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(invalid)?;
            let host = &rest[..end];
            let port = match &rest[end + 1..] {
                "" => None,
                tail => Some(tail.strip_prefix(':').ok_or_else(invalid)?),
            };
            (host, port)
        } else if s_trim.matches(':').count() > 1 {
            // Unbracketed IPv6 literal; no room for a port.
            s_trim.parse::<IpAddr>().map_err(|_| invalid())?;
            (s_trim, None)
        } else {
            match s_trim.split_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s_trim, None),
            }
        };

        if host.is_empty() {
            return Err(invalid());
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_TARGET_PORT,
        };

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Decides which upstream a negotiated connection actually reaches.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RoutingPolicy {
    /// Honor the target the client asked for.
    #[default]
    Requested,
    /// Pin every connection to one backend regardless of the request.
    Fixed(Target),
}

impl RoutingPolicy {
    pub fn route(&self, requested: Target) -> Target {
        match self {
            RoutingPolicy::Requested => requested,
            RoutingPolicy::Fixed(target) => target.clone(),
        }
    }
}
