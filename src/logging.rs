//! Logging initialization using tracing.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber with the specified log level.
///
/// `RUST_LOG` takes precedence over `level` when set. Events go to stderr so
/// rendered output on stdout stays clean.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .init();
}

/// Log level selected by the command line flags
pub fn level_for(verbose: bool, log_level: Option<&str>) -> &str {
    match (log_level, verbose) {
        (Some(level), _) => level,
        (None, true) => "debug",
        (None, false) => "info",
    }
}
