use tracing_subscriber::EnvFilter;

/// Install a compact stderr subscriber.
///
/// Filter precedence: `filter` argument, then `RUST_LOG`, then `info`. Returns false if a
/// global subscriber was already installed. Library code never calls this.
pub fn init_logging(filter: Option<&str>) -> bool {
    let env_filter = match filter {
        Some(f) => EnvFilter::new(f),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_names(true)
        .compact()
        .try_init()
        .is_ok()
}
