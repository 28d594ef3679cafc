//! Process-wide tracing setup shared by every chainsync binary and test harness.

/// Initialize tracing with JSON output.
///
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(LogFormat::Json);
}

pub use tracing::{LogFormat, init_with};

/// Subscriber configuration (filters, output format).
pub mod tracing;
