//! Logging setup

use tracing_subscriber::util::TryInitError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `log_level`; an unparsable directive
/// falls back to `info`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed
pub fn init_tracing(log_level: &str, json: bool) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_target(true)))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_target(true)))
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_rejected() {
        // Another test may already have installed a subscriber.
        let _ = init_tracing("debug", false);
        assert!(init_tracing("debug", true).is_err());
    }
}
