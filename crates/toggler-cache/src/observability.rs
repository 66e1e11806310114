//! Tracing setup driven by [`LoggingConfig`].
//!
//! The filter sits behind a reload layer, so a new `logging.level` takes
//! effect without reinstalling the subscriber. `RUST_LOG` overrides the
//! configured level at install time.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

use crate::config::LoggingConfig;

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

/// Parses a level directive such as `info` or `toggler_cache=debug,warn`.
pub fn parse_level(level: &str) -> Result<EnvFilter, String> {
    EnvFilter::try_new(level).map_err(|e| format!("invalid logging.level {level:?}: {e}"))
}

/// Installs the global subscriber at `logging.level`.
///
/// Returns `Ok(false)` when another subscriber was installed first; the
/// level of that one is left alone.
pub fn init_tracing(logging: &LoggingConfig) -> Result<bool, String> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => parse_level(&logging.level)?,
    };
    let (reload_layer, handle) = reload::Layer::new(filter);

    let installed = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok();
    if installed {
        let _ = FILTER_HANDLE.set(handle);
    }
    Ok(installed)
}

/// Switches the subscriber installed by [`init_tracing`] to `logging.level`.
/// Without one, only the level is checked.
pub fn apply_logging(logging: &LoggingConfig) -> Result<(), String> {
    let filter = parse_level(&logging.level)?;
    if let Some(handle) = FILTER_HANDLE.get() {
        handle
            .reload(filter)
            .map_err(|e| format!("log filter reload failed: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(level: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
        }
    }

    #[test]
    fn test_parse_level() {
        assert!(parse_level("debug").is_ok());
        assert!(parse_level("toggler_cache=trace,warn").is_ok());
        assert!(parse_level("toggler_cache=verbose").is_err());
    }

    #[test]
    fn test_init_then_reload() {
        init_tracing(&level("debug")).unwrap();
        assert!(!init_tracing(&level("warn")).unwrap());

        apply_logging(&level("trace")).unwrap();
        tracing::trace!("reloaded filter lets trace through");
        assert!(apply_logging(&level("toggler_cache=verbose")).is_err());
    }
}
