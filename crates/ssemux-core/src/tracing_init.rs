//! Tracing/logging initialization shared by the `ssemux` binaries.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Build the default filter directive for a binary crate at `level`.
///
/// The core crate is always included so session-level warnings (write and
/// drain failures) reach the same sink as the binary's own logs.
pub fn default_filter(bin_crate: &str, level: &str) -> String {
    format!("{bin_crate}={level},ssemux_core={level}")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins over `default_filter` when set. With `log_json` the
/// output is one JSON object per line for log aggregation.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(env_filter);
    if log_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_filter_covers_core() {
        assert_eq!(
            default_filter("ssemux_server", "debug"),
            "ssemux_server=debug,ssemux_core=debug"
        );
    }
}
