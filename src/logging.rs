//! Tracing subscriber setup for binaries and tests embedding the link.

use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

/// Install a fmt subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.as_str()));
    install(filter);
}

/// Install a subscriber with an explicit directive such as
/// `missionlink_core::sync_engine=debug`. Falls back to `info` if the
/// directive does not parse.
pub fn init_with_directive(directive: &str) {
    let filter = EnvFilter::try_new(directive).unwrap_or_else(|err| {
        eprintln!("invalid log directive {directive:?}: {err}, using info");
        EnvFilter::new(Level::INFO.as_str())
    });
    install(filter);
}

fn install(filter: EnvFilter) {
    let _ = Registry::default()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init();
}
