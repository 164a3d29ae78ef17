//! Telemetry helpers for structured logging and tracing.

use tracing_subscriber::EnvFilter;

/// Variable read first for log directives; `RUST_LOG` is the fallback.
pub const LOG_ENV: &str = "REACTORLAB_LOG";

/// Directives used when neither variable is set.
pub const DEFAULT_LOG_DIRECTIVE: &str = "reactorlab=info";

/// Install a formatting subscriber unless the process already has one.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
