use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info,csv_api=debug";

/// Install the global fmt subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    // a second call (tests) leaves the first subscriber in place
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
