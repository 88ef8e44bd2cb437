//! Diagnostics for the supervisor itself.
//!
//! Child output owns stdout, so tracing goes to stderr. `RUST_LOG` selects the
//! level and defaults to `info`.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber.
///
/// # Example
/// ```bash
/// RUST_LOG=envrack=debug envrack -c xe.yml -- ./server
/// ```
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
