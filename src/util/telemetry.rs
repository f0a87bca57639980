//! Telemetry bootstrap for the queue's structured logging.

use tracing_subscriber::EnvFilter;

/// Directive applied when the environment specifies no filter: queue
/// transitions at info, everything else quiet.
const DEFAULT_FILTER: &str = "director_jobq=info";

/// Initialize tracing for a daemon or test harness embedding the queue.
///
/// Honors `RUST_LOG` when set, falling back to `director_jobq=info`
/// otherwise. Embedders with their own subscriber simply skip this; a second
/// call (or a subscriber installed elsewhere) is a no-op.
pub fn init_tracing() {
    init_tracing_with(DEFAULT_FILTER);
}

/// Initialize tracing with a specific fallback filter directive, e.g.
/// `"director_jobq=debug"` to watch individual promotion passes.
pub fn init_tracing_with(fallback: &str) {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_tracing();
        init_tracing_with("director_jobq=trace");
        init_tracing();
    }
}
