//! Tracing subscriber: JSON lines on stdout, filtered by `RUST_LOG`.

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

/// Directive used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info";

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Install the global subscriber with [`DEFAULT_FILTER`].
pub fn init() {
    init_with_default(DEFAULT_FILTER);
}

/// Install the global subscriber, falling back to `default_filter` without `RUST_LOG`.
///
/// Only the first call in a process installs anything; later calls (tests, embedded
/// servers) are no-ops. Returns whether this call installed the subscriber.
pub fn init_with_default(default_filter: &str) -> bool {
    let mut installed_here = false;
    INSTALLED.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_filter));

        // Another subscriber may already be set (e.g. by a test harness).
        installed_here = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(false)
            .try_init()
            .is_ok();
        installed_here
    });
    installed_here
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_initialisation_is_harmless() {
        init();
        assert!(!init_with_default("debug"));
        ::tracing::info!(component = "observability", "still logging");
    }
}
