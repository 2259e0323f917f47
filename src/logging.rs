//! Structured logging with tracing.
//!
//! `RUST_LOG` wins over the level passed on the command line. Log lines go to
//! stderr so one-shot runs can pipe the JSON task result from stdout.

use tracing_subscriber::{fmt, EnvFilter};

/// `RUST_LOG` if set and valid, otherwise `level`.
pub fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn init_logging(level: &str) -> bool {
    fmt()
        .with_env_filter(filter_for(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .is_ok()
}
