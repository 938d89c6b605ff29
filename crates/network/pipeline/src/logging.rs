//! Tracing setup for binaries and tests that embed the pipeline.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "warn,net=info";

/// Installs a global `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter`. Returns false when a subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
