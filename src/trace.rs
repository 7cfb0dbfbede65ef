//! Tracing initialization for binaries and tests.

use std::sync::Once;

use tracing_subscriber::{filter::EnvFilter, prelude::*};

static INIT: Once = Once::new();

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing once: a compact fmt layer filtered by `RUST_LOG`
/// (default `info`). Safe to call from every test; only the first call wins.
pub fn init() {
    INIT.call_once(|| {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .compact()
            .with_filter(build_env_filter());
        tracing_subscriber::registry().with(fmt_layer).init();
    });
}
