//! Tracing initialization.
//!
//! Sets up `tracing-subscriber` with console output and an `EnvFilter`
//! (default level `info`, overridable via `RUST_LOG`). The embedding
//! application may install its own subscriber instead; this helper is safe to
//! call when one is already set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Initialize tracing with console output.
pub fn init_telemetry() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed, keeping the existing one");
    }
}
