//! Logging initialization.
//!
//! Log lines go through a non-blocking writer: producers push onto a bounded
//! queue and a dedicated worker thread drains it to stdout in submission
//! order. Connection tasks never wait on log I/O.

use std::io;

use clap::ValueEnum;
use tracing_appender::non_blocking::{NonBlocking, NonBlockingBuilder, WorkerGuard};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Maximum queued log lines before new ones are dropped.
const LOG_QUEUE_LINES: usize = 128_000;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human-readable single line.
    Compact,
}

/// Build the non-blocking sink over any writer.
///
/// The returned guard flushes queued lines when dropped; keep it alive for
/// as long as logging is needed.
pub fn sink<W>(writer: W) -> (NonBlocking, WorkerGuard)
where
    W: io::Write + Send + 'static,
{
    NonBlockingBuilder::default()
        .lossy(true)
        .buffered_lines_limit(LOG_QUEUE_LINES)
        .thread_name("tunnel-log")
        .finish(writer)
}

/// Initialize the global subscriber.
///
/// Prefers `RUST_LOG`, falling back to `level`.
pub fn init(level: &str, format: LogFormat) -> anyhow::Result<WorkerGuard> {
    let (writer, guard) = sink(io::stdout());

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(writer)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()?;

    Ok(guard)
}
