use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// Output goes to stderr so a process speaking the stdio protocol never mixes
/// log lines into its stdout frames. The filter comes from `RUST_LOG`, falling
/// back to `default_filter`. Calling this twice is harmless; the second
/// installation is ignored.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}
