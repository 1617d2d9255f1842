//! Tracing setup for the CLI and for embedders that want StreamVM's logs.

use std::sync::OnceLock;

use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::EnvFilter;

static INIT: OnceLock<()> = OnceLock::new();

/// Installs the global fmt subscriber at `info`.
pub fn init(component: &str) {
    init_with_default(component, "info");
}

/// Installs the global fmt subscriber once. `RUST_LOG` wins over
/// `default_directives` when set; later calls only log.
pub fn init_with_default(component: &str, default_directives: &str) {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives));
        // Another subscriber may already be installed by the embedder.
        let _ = SubscriberBuilder::default()
            .with_env_filter(filter)
            .with_target(true)
            .with_ansi(true)
            .with_writer(std::io::stderr)
            .compact()
            .try_init();
    });
    tracing::debug!(component, "tracing initialised");
}
