//! Process-wide tracing setup.

/// Initialize structured logging at `level` (`RUST_LOG` takes precedence).
///
/// Safe to call multiple times; subsequent calls are no-ops. Returns the level
/// actually applied when `RUST_LOG` is unset.
pub fn init(level: &str) -> tracing_subscriber::filter::LevelFilter {
    self::tracing::init(level)
}

/// Tracing configuration (filters, layers).
pub mod tracing;
