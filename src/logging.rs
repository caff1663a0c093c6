use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "mxfile_core=info";

/// Installs a stderr subscriber. `RUST_LOG` wins over `default_filter`. Calling it twice is
/// harmless; the second call leaves the first subscriber in place.
pub fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

/// Filter for a `-v` count on top of the default.
pub fn verbosity_filter(verbose: u8) -> String {
    match verbose {
        0 => DEFAULT_FILTER.to_string(),
        1 => "mxfile_core=debug".to_string(),
        _ => "mxfile_core=trace".to_string(),
    }
}
