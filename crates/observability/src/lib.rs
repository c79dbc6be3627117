//! Process-wide tracing setup shared by the binaries.

/// Initialize JSON logging filtered by `RUST_LOG` (default `info`).
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    self::tracing::init_with(self::tracing::LogFormat::from_env(), Vec::new());
}

/// Subscriber and output format configuration.
pub mod tracing;

pub use self::tracing::{BoxedLayer, LogFormat, init_with};
