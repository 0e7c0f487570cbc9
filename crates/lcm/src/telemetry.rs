//! Tracing initialization.
//!
//! Everything goes to stderr: inject's stdout is consumed verbatim by the
//! host, so a single stray log line on stdout would corrupt the context
//! block. Filtering follows `RUST_LOG`, defaulting to `info`.

use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // try_init so tests and embedders that already installed a subscriber
    // are not clobbered.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
