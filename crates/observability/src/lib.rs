//! Process-wide tracing setup shared by EventVault binaries.

/// Initialize structured logging.
///
/// JSON by default; `EVENTVAULT_LOG_FORMAT=pretty` switches to human-readable
/// output. Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::Format::from_env());
}

/// Subscriber configuration (filters, formats).
pub mod tracing;
