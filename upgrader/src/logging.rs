//! Development-time tracing for debugging the orchestrator.
//!
//! Tracing here is dev diagnostics via `RUST_LOG` on stderr. Product output
//! (status file, artifacts, reports under `output/`) is always written and
//! unaffected by `RUST_LOG`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output: stderr, compact format.
///
/// # Example
/// ```bash
/// RUST_LOG=upgrader=debug cargo run -- upgrade --old-tag a --new-tag b
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
