//! Tracing/logging initialization.
//!
//! JSON lines with timestamps. Filtering comes from `RUST_LOG` when set,
//! otherwise from the configured level. An unparsable level is reported once
//! the subscriber is up and `info` is used instead.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

pub const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;

/// Parse a level name (`trace`, `debug`, `info`, `warn`, `error`, `off`).
pub fn parse_level(level: &str) -> Option<LevelFilter> {
    LevelFilter::from_str(level.trim()).ok()
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(level: &str) -> LevelFilter {
    let parsed = parse_level(level);
    let effective = parsed.unwrap_or(DEFAULT_LEVEL);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(effective.to_string()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();

    if parsed.is_none() {
        ::tracing::warn!(level, "couldn't parse log level, using info");
    }

    effective
}
