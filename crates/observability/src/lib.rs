//! Process-wide tracing setup shared by the binaries.

/// Initialize tracing with the format named by `MAILPULSE_LOG_FORMAT`.
///
/// Safe to call multiple times; later calls are no-ops.
pub fn init() {
    let format = std::env::var("MAILPULSE_LOG_FORMAT")
        .ok()
        .and_then(|v| tracing::LogFormat::parse(&v))
        .unwrap_or_default();
    tracing::init(format);
}

/// Subscriber configuration (filter, format).
pub mod tracing;
