//! Bidirectional relay between a negotiated client and its upstream.
//!
//! Each direction waits for read readiness on its source and moves what is
//! available with the zero-copy [`Transfer`] when one exists, falling back to
//! [`CopyTransfer`] when zero-copy would block or is unsupported. The relay
//! ends on the first of: EOF on either side, a hard I/O error, the idle
//! window elapsing with no traffic, or shutdown.
//!
//! ```text
//! client --readable--> [splice | copy] --> upstream
//! client <-- [splice | copy] <--readable-- upstream
//!                 idle watchdog (1s ticks)
//! ```

#[cfg(target_os = "linux")]
mod splice;
mod transfer;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::{Config, DEFAULT_BUFFER_SIZE, DEFAULT_IDLE_TIMEOUT};
use crate::error::RelayError;
use crate::shutdown::{self, Shutdown};

#[cfg(target_os = "linux")]
pub use splice::SpliceTransfer;
pub use transfer::{CopyTransfer, Transfer};

/// Granularity of the idle watchdog.
pub const IDLE_TICK: Duration = Duration::from_secs(1);

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Relay ends after this long with no traffic in either direction.
    pub idle_timeout: Duration,
    /// Per-operation quota in bytes.
    pub buffer_size: usize,
    /// Try splice(2) first.
    pub zero_copy: bool,
}

impl RelayConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            idle_timeout: config.idle_timeout,
            buffer_size: config.buffer_size,
            zero_copy: config.zero_copy,
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            zero_copy: true,
        }
    }
}

/// Why a relay stopped without a hard error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    UpstreamClosed,
    IdleTimeout,
    Shutdown,
}

/// Result of a finished relay.
#[derive(Debug)]
pub struct RelayOutcome {
    pub end: Result<RelayEnd, RelayError>,
    pub bytes_to_upstream: u64,
    pub bytes_from_upstream: u64,
}

/// Zero-copy mover for this platform, if any.
#[cfg(target_os = "linux")]
fn zero_copy(quota: usize) -> Option<Box<dyn Transfer>> {
    match SpliceTransfer::new(quota) {
        Ok(t) => Some(Box::new(t)),
        Err(e) => {
            debug!(error = %e, "splice unavailable, using buffered copy");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn zero_copy(_quota: usize) -> Option<Box<dyn Transfer>> {
    None
}

/// One direction of the relay.
struct Pump {
    zero_copy: Option<Box<dyn Transfer>>,
    copy: CopyTransfer,
}

impl Pump {
    fn new(config: &RelayConfig) -> Self {
        Self {
            zero_copy: if config.zero_copy {
                zero_copy(config.buffer_size)
            } else {
                None
            },
            copy: CopyTransfer::new(config.buffer_size),
        }
    }

    /// Pump until EOF on `from` or an error.
    async fn run(
        &mut self,
        from: &TcpStream,
        to: &TcpStream,
        moved: &AtomicU64,
        activity: &AtomicU64,
    ) -> io::Result<()> {
        loop {
            from.readable().await?;
            match self.step(from, to).await? {
                None => continue,
                Some(0) => return Ok(()),
                Some(n) => {
                    moved.fetch_add(n as u64, Ordering::Relaxed);
                    activity.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// One transfer attempt. `None` means nothing was ready.
    async fn step(&mut self, from: &TcpStream, to: &TcpStream) -> io::Result<Option<usize>> {
        if let Some(zc) = self.zero_copy.as_mut() {
            match zc.transfer(from, to).await {
                Ok(n) => return Ok(Some(n)),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Unsupported => {
                    debug!(transfer = zc.name(), error = %e, "Zero-copy unsupported, falling back");
                    self.zero_copy = None;
                }
                Err(e) => return Err(e),
            }
        }

        match self.copy.transfer(from, to).await {
            Ok(n) => Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Resolve once `window` passes with no change in `activity`.
///
/// Checks once per tick and accumulates consecutive quiet ticks.
async fn idle_watchdog(window: Duration, activity: &AtomicU64) {
    let tick = window.min(IDLE_TICK).max(Duration::from_millis(1));
    let limit = (window.as_millis() / tick.as_millis()).max(1);

    let mut ticker = interval_at(Instant::now() + tick, tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut seen = activity.load(Ordering::Relaxed);
    let mut quiet: u128 = 0;
    loop {
        ticker.tick().await;
        let now = activity.load(Ordering::Relaxed);
        if now == seen {
            quiet += 1;
            if quiet >= limit {
                return;
            }
        } else {
            seen = now;
            quiet = 0;
        }
    }
}

/// Relay bytes between `client` and `upstream` until one side ends.
pub async fn relay(
    client: &TcpStream,
    upstream: &TcpStream,
    config: &RelayConfig,
    shutdown: &mut Shutdown,
) -> RelayOutcome {
    let to_upstream = AtomicU64::new(0);
    let from_upstream = AtomicU64::new(0);
    let activity = AtomicU64::new(0);

    let mut up = Pump::new(config);
    let mut down = Pump::new(config);

    let end = tokio::select! {
        r = up.run(client, upstream, &to_upstream, &activity) => r
            .map(|_| RelayEnd::ClientClosed)
            .map_err(RelayError::ClientToUpstream),
        r = down.run(upstream, client, &from_upstream, &activity) => r
            .map(|_| RelayEnd::UpstreamClosed)
            .map_err(RelayError::UpstreamToClient),
        _ = idle_watchdog(config.idle_timeout, &activity) => Ok(RelayEnd::IdleTimeout),
        _ = shutdown::requested(shutdown) => Ok(RelayEnd::Shutdown),
    };

    RelayOutcome {
        end,
        bytes_to_upstream: to_upstream.load(Ordering::Relaxed),
        bytes_from_upstream: from_upstream.load(Ordering::Relaxed),
    }
}
