//! Engine configuration.
//!
//! Hosts deserialize this from their own configuration source (the runner
//! uses the `config` crate over environment variables). Every field has a
//! default, so an empty source yields a working engine.

use serde::Deserialize;
use std::time::Duration;

/// Tunables of the execution core.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EngineConfig {
    /// How long a gated node waits for a decision before it is denied.
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,

    /// Upper bound on a single adapter call. Unbounded when unset.
    #[serde(default)]
    pub node_timeout_secs: Option<u64>,

    /// Replay page size when the caller does not ask for one.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    /// Largest replay page served; bigger requests are clamped.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,

    /// Runs executing at once. Further submissions wait in `pending`.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Loop iterations in flight when a loop node sets no `concurrency`.
    #[serde(default = "default_loop_concurrency")]
    pub default_loop_concurrency: usize,
}

fn default_confirmation_timeout_secs() -> u64 {
    300
}

fn default_page_size() -> usize {
    100
}

fn default_max_page_size() -> usize {
    1000
}

fn default_max_concurrent_runs() -> usize {
    64
}

fn default_loop_concurrency() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            node_timeout_secs: None,
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
            max_concurrent_runs: default_max_concurrent_runs(),
            default_loop_concurrency: default_loop_concurrency(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    #[must_use]
    pub fn node_timeout(&self) -> Option<Duration> {
        self.node_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_has_correct_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.confirmation_timeout(), Duration::from_secs(300));
        assert_eq!(config.node_timeout(), None);
        assert_eq!(config.default_page_size, 100);
        assert_eq!(config.max_page_size, 1000);
        assert_eq!(config.max_concurrent_runs, 64);
        assert_eq!(config.default_loop_concurrency, 1);
    }

    #[test]
    fn empty_source_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").expect("deserialize");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn partial_source_overrides() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"node_timeout_secs": 5, "max_page_size": 50}"#)
                .expect("deserialize");
        assert_eq!(config.node_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.max_page_size, 50);
        assert_eq!(config.default_page_size, 100);
    }
}
