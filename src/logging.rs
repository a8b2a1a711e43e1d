use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` wins over the defaults; quiet
/// mode drops progress messages and keeps warnings.
pub fn init_logging(quiet: bool) {
    let default = if quiet { "warn" } else { "info,globset=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .try_init();
}
