//! Helpers related to tracing, used by main entrypoints

/// Initialize tracing with the default configuration.
///
/// Output goes to stderr so that stdout stays free for `--tar-to-stdout`.
/// The level is controlled with `RUST_LOG` and defaults to `info`.
pub fn initialize_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Don't include timestamps and such because they're not really useful and
    // too verbose, and plus several log targets such as journald will already
    // include timestamps.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    // Log to stderr by default
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
