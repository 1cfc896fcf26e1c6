use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info,crawl::scheduler=info,crawl::worker=warn,crawl::invariant=error";

/// Installs the global `fmt` subscriber. `RUST_LOG` overrides [`DEFAULT_FILTER`]; `verbose`
/// raises the engine targets to debug instead.
pub fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "info,crawl=debug".to_string()
    } else {
        DEFAULT_FILTER.to_string()
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
