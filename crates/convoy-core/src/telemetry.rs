//! Tracing setup for Convoy binaries, driven by the `[logging]` section.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over `logging.level`, which may be any
/// `EnvFilter` directive (`info`, `warn,convoy_core::scheduler=debug`).
/// JSON output carries the current span so group and deployment ids from
/// `#[instrument]` land on every line. Returns `false` if a subscriber was
/// already installed.
pub fn init_from_config(logging: &LoggingConfig) -> bool {
    let json = logging
        .json
        .then(|| fmt::layer().json().with_current_span(true).with_span_list(false));
    let text = (!logging.json).then(fmt::layer);

    tracing_subscriber::registry()
        .with(env_filter(&logging.level))
        .with(json)
        .with(text)
        .try_init()
        .is_ok()
}

/// `RUST_LOG`, else `level`, else `info`.
fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialisation_is_refused() {
        init_from_config(&LoggingConfig::default());
        let again = init_from_config(&LoggingConfig {
            json: true,
            level: "warn,convoy_core::scheduler=debug".to_string(),
        });
        assert!(!again);
    }

    #[test]
    fn directive_levels_are_accepted() {
        assert!(EnvFilter::try_new("warn,convoy_core::scheduler=debug").is_ok());
        assert!(EnvFilter::try_new("info").is_ok());
    }
}
