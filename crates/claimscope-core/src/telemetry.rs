//! Tracing setup shared by the `claimscope` CLI and the `claimscoped` daemon.
//!
//! [`init_tracing`] installs the global subscriber: an `EnvFilter` plus
//! either human-readable or newline-delimited JSON output. Later calls are
//! ignored, since a process can only have one global subscriber.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; `level` applies only when it is unset.
/// The daemon logs to stdout, the CLI to stderr so that command output
/// stays pipeable.
pub fn init_tracing(json: bool, level: Level) {
    init_tracing_with_writer(json, level, Writer::Stdout)
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Writer {
    Stdout,
    Stderr,
}

pub fn init_tracing_with_writer(json: bool, level: Level, writer: Writer) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    match (json, writer) {
        (true, Writer::Stdout) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok(),
        (true, Writer::Stderr) => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
            .ok(),
        (false, Writer::Stdout) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok(),
        (false, Writer::Stderr) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init()
            .ok(),
    };
}
