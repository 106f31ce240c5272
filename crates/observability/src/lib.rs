//! Tracing and logging (shared setup).

/// Initialize process-wide logging with the format named by `LOG_FORMAT`.
///
/// An unrecognised value falls back to JSON and is reported as a warning once
/// logging is up. This is safe to call multiple times; subsequent calls become
/// no-ops.
pub fn init() {
    let raw = std::env::var(tracing::LOG_FORMAT_VAR).ok();
    match tracing::resolve_format(raw.as_deref()) {
        Ok(format) => tracing::init(format),
        Err(err) => {
            tracing::init(LogFormat::default());
            ::tracing::warn!(error = %err, "unrecognised LOG_FORMAT, using JSON logs");
        }
    }
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use tracing::{LogFormat, UnknownLogFormat, resolve_format};
