//! Tracing initialization.
//!
//! Structured logging for the sweep core uses the `tracing` crates. The
//! helper here installs a compact fmt subscriber with an `EnvFilter`; the
//! `RUST_LOG` variable takes precedence over the level passed in.
//!
//! Initialization is idempotent so tests and embedding applications can call
//! it freely.

use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Install the global subscriber. Subsequent calls are no-ops.
pub fn init(level: Level) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let fmt_layer = fmt::layer()
        .compact()
        .with_thread_names(true)
        .with_filter(env_filter);

    // Already-initialized is expected when multiple components race here.
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
}
