//! Tracing setup for hosts embedding the transfer layer.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Filter directive for `verbosity` (0=error, 1=warn, 2=info, 3=debug, 4+=trace).
pub fn level_filter(verbosity: u8) -> String {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    format!("sealshare_core={}", level)
}

/// Install a stderr fmt subscriber. `RUST_LOG` takes precedence over `verbosity`.
/// Fails if a global subscriber is already set.
pub fn init_logging(verbosity: u8) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_filter(verbosity)));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(verbosity >= 3)
                .with_line_number(verbosity >= 3),
        )
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}
