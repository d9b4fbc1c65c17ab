//! Tracing subscriber setup for the command-line front end
//!
//! Filter priority: `RUST_LOG`, then the level passed by the caller, then
//! `info`.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const DEFAULT_LEVEL: &str = "info";

/// Filter for `level` unless `RUST_LOG` overrides it
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

/// Install the global subscriber. A second call is a no-op.
pub fn init(level: &str) {
    tracing_subscriber::registry()
        .with(env_filter(level))
        .with(fmt::layer().with_target(true).without_time())
        .try_init()
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init("debug");
        init("warn");
        tracing::debug!("still logging");
    }

    #[test]
    fn test_level_used_without_rust_log() {
        if std::env::var_os("RUST_LOG").is_none() {
            let filter = env_filter("warn");
            assert_eq!(
                filter.max_level_hint(),
                Some(tracing_subscriber::filter::LevelFilter::WARN)
            );
        }
    }
}
