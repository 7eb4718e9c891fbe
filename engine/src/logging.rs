//! Diagnostic tracing for the engine.
//!
//! Rejected commands, persistence failures and session transitions are
//! emitted as `tracing` events. Library code never installs a subscriber;
//! the CLI calls [`init`] once at startup.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber.
///
/// Reads `RUST_LOG`, defaulting to `warn`. Output goes to stderr in compact
/// format so stdout stays reserved for JSON results.
///
/// # Example
/// ```bash
/// RUST_LOG=engine=debug engine apply --session slot-1 --file batch.json
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
