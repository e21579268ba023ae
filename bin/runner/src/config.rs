//! Runner configuration.
//!
//! Loaded via the `config` crate from `BRAID__`-prefixed environment
//! variables, e.g. `BRAID__ENGINE__MAX_CONCURRENT_RUNS=8`.

use braid_workflow::EngineConfig;
use serde::Deserialize;

/// Runner configuration composed from library configs.
#[derive(Debug, Default, Deserialize)]
pub struct RunnerConfig {
    /// Execution core tunables.
    #[serde(default)]
    pub engine: EngineConfig,
}

impl RunnerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(environment())
    }

    fn from_source(source: config::Environment) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize()
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix("BRAID")
        .separator("__")
        .try_parsing(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RunnerConfig, config::ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        RunnerConfig::from_source(environment().source(Some(vars)))
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let config = load(&[]).expect("load");
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn nested_engine_overrides() {
        let config = load(&[
            ("BRAID__ENGINE__MAX_CONCURRENT_RUNS", "8"),
            ("BRAID__ENGINE__NODE_TIMEOUT_SECS", "30"),
        ])
        .expect("load");
        assert_eq!(config.engine.max_concurrent_runs, 8);
        assert_eq!(config.engine.node_timeout_secs, Some(30));
        assert_eq!(config.engine.max_page_size, 1000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(load(&[("BRAID__ENGINE__MAX_PAGE_SIZE", "lots")]).is_err());
    }
}
