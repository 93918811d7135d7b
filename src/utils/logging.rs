//! Tracing subscriber setup

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the default subscriber.
///
/// Honors `RUST_LOG`; otherwise logs this crate at debug level. Calling it
/// more than once keeps the first subscriber.
pub fn init() {
    let result = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "screenstudio_encoder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if result.is_ok() {
        tracing::info!("Starting screenstudio-encoder v{}", env!("CARGO_PKG_VERSION"));
    }
}
