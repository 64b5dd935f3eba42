//! Logging setup
//!
//! Tracing subscriber initialization shared by binaries and tests.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber. Safe to call more than
/// once; later calls are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
    }
}
