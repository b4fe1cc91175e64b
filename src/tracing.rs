//! Tracing (logging)

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Default log filter.
fn default_filter(verbose: bool) -> &'static str {
    if verbose {
        "cellxgene_server=debug,tower_http=debug"
    } else {
        "cellxgene_server=info,tower_http=info"
    }
}

/// Initlialise tracing (logging)
///
/// Applies a filter based on the `RUST_LOG` environment variable, falling back to info logging
/// for this crate and tower_http if not set, or debug logging when `verbose` is set.
pub fn init_tracing(verbose: bool) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(verbose).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
