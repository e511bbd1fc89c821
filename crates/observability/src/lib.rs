//! Process-wide tracing setup shared by the binary and tests.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use tracing::{ObservabilityConfig, ObservabilityError, init_with};

/// Initialize tracing with defaults (JSON, `info`, overridable via `RUST_LOG`).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    let _ = tracing::init_with(&ObservabilityConfig::default());
}
