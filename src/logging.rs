//! Tracing subscriber setup for hosts embedding the crate.

use std::env;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Environment variable holding the filter directives, e.g. `taskdeck=debug`.
pub const LOG_ENV: &str = "TASKDECK_LOG";
const DEFAULT_FILTER: &str = "info";

/// Installs a stdout fmt subscriber filtered by `TASKDECK_LOG`.
///
/// Returns `false` when a global subscriber was already installed, which
/// makes repeated calls (several tests, or an embedding app that set up its
/// own subscriber) harmless.
pub fn init_tracing() -> bool {
    let filter = env::var(LOG_ENV).unwrap_or_else(|_| DEFAULT_FILTER.to_string());
    let filter_layer =
        EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let installed = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_ansi(false))
        .with(filter_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(filter = %filter, "tracing initialised");
    }
    installed
}
