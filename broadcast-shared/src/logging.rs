//! # Logging Bootstrap
//!
//! Thin `tracing-subscriber` initializer shared by both binaries, mirroring
//! `tasker_shared::logging::init_tracing()`'s entry point for its own server
//! binaries.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize global tracing: env-filter (`RUST_LOG`, default `info`) plus
/// either a human-readable or JSON formatter depending on `LOG_FORMAT`.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .ok();
    }
}
