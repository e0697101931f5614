//! Tracing subscriber setup.
//!
//! Reads `RUST_LOG`; falls back to `info` (or `debug` with `--verbose`).
//! Output goes to stderr in compact format so stdout stays clean for
//! command output such as tables and replay summaries.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber. Call once, before any other work.
pub fn init(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
