//! Structured logging setup backed by `tracing`.

use std::sync::Once;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

static INIT_LOGGING: Once = Once::new();

/// Install the global subscriber. Later calls are no-ops.
///
/// The filter is taken from `RUST_LOG`, then `CROSSTRACK_LOG`, then defaults to `info`.
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let fallback = std::env::var("CROSSTRACK_LOG").unwrap_or_else(|_| "info".into());
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(fallback))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let layer = fmt::layer().with_target(true).with_thread_names(true);

        // Another subscriber may already be installed by the host application.
        if tracing_subscriber::registry().with(filter).with(layer).try_init().is_err() {
            tracing::debug!("global subscriber already set, keeping it");
        }
    });
}
