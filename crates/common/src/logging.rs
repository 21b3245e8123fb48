use tracing_subscriber::EnvFilter;

/// Initialise the global tracing subscriber.
///
/// Honours `RUST_LOG`; defaults to `info` when unset.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
