//! Tracing and logging setup shared by both service binaries.

/// Tracing configuration (filters, output format).
pub mod tracing;

pub use self::tracing::LogFormat;

/// Initialize process-wide logging for `service`.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init(service: &'static str) {
    self::tracing::init(service, LogFormat::from_env());
}
