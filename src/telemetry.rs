//! Log subscriber setup.

use std::sync::OnceLock;

use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the log filter.
pub const LOG_ENV: &str = "DERIVATION_LOG";

/// Installs a `fmt` subscriber filtered by `DERIVATION_LOG`, falling back
/// to `default_directive`. Later calls are no-ops; logs go to stderr.
pub fn init(default_directive: &str) {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_new(default_directive))
            .unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .try_init();
    });
}
