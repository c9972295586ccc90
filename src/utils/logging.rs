//! Structured logging setup for host applications.
//!
//! The engine only emits `tracing` events; installing a subscriber is the
//! host's call. [`init_logging`] is a ready-made one: `RUST_LOG` wins when set,
//! otherwise the level from [`LoggingConfig`] applies.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Install a global fmt subscriber built from `config`.
///
/// Returns `false` if a global subscriber was already installed, in which case
/// the existing one stays in place.
pub fn init_logging(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.to_string()));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config);
        assert!(!init_logging(&config));
        tracing::info!("still logging after a repeated init");
    }
}
