//! # Configuration
//!
//! Layered configuration loading: a base TOML file, an optional
//! environment-specific overlay, and environment-variable overrides, using
//! the `config` crate the same way `tasker::TaskerConfig` loads its layers.

pub mod circuit_breaker;
pub mod common;
pub mod orchestration;
pub mod worker;

pub use circuit_breaker::CircuitBreakerConfig;
pub use common::CommonConfig;
pub use orchestration::OrchestrationConfig;
pub use worker::WorkerConfig;

use serde::{Deserialize, Serialize};

/// Root configuration object loaded by both binaries. Only the section
/// relevant to the running binary is typically consulted, but both are
/// always present so shared code (presence, resilience) can read common
/// settings regardless of which process it runs in.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BroadcastConfig {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

impl BroadcastConfig {
    /// Load from `config/broadcast/base.toml`, an optional
    /// `config/broadcast/{env}.toml` overlay selected by `BROADCAST_ENV`
    /// (default `development`), and `BROADCAST__`-prefixed environment
    /// variables (double underscore separates nesting, e.g.
    /// `BROADCAST__WORKER__SSE__HEARTBEAT_INTERVAL_MS`).
    pub fn load() -> Result<Self, config::ConfigError> {
        let env = std::env::var("BROADCAST_ENV").unwrap_or_else(|_| "development".to_string());
        Self::load_from("config/broadcast", &env)
    }

    /// Shared by [`Self::load`] and its tests: `config_dir_prefix` is joined
    /// with `/base` and `/{env}` to form the two layered TOML sources,
    /// taking an absolute path in tests so they don't depend on process cwd.
    fn load_from(config_dir_prefix: &str, env: &str) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name(&format!("{config_dir_prefix}/base")).required(false))
            .add_source(
                config::File::with_name(&format!("{config_dir_prefix}/{env}")).required(false),
            )
            .add_source(
                config::Environment::with_prefix("BROADCAST")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_has_sane_defaults() {
        let cfg = BroadcastConfig::default();
        assert!(cfg.orchestration.scheduler.activation_tick_period_ms > 0);
        assert!(cfg.worker.sse.max_connections_per_user > 0);
    }

    #[test]
    fn layered_toml_overlay_overrides_base() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base_path = dir.path().join("base.toml");
        let mut base = std::fs::File::create(&base_path).expect("create base.toml");
        writeln!(base, "[worker.sse]\nmax_connections_per_user = 3").unwrap();

        let staging_path = dir.path().join("staging.toml");
        let mut staging = std::fs::File::create(&staging_path).expect("create staging.toml");
        writeln!(staging, "[worker.sse]\nmax_connections_per_user = 7").unwrap();

        let prefix = dir.path().to_str().expect("utf8 tempdir path");
        let cfg = BroadcastConfig::load_from(prefix, "staging").expect("load layered config");
        assert_eq!(cfg.worker.sse.max_connections_per_user, 7);

        let base_only = BroadcastConfig::load_from(prefix, "production").expect("load base-only config");
        assert_eq!(base_only.worker.sse.max_connections_per_user, 3);
    }
}
